// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Prometheus endpoint of the sidecar.
//!
//! Serves `/metrics` in the Prometheus text format and `/healthz` for
//! kubelet health checks. The server is the first part stopped during shutdown.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::logpipe::Pipe;
use crate::shutdown::{MetricsEndpoint, ShutdownError};

/// Time allowed for in-flight scrapes to finish on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the metrics endpoint.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Registering or encoding a metric failed.
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Encoded output was not valid UTF-8.
    #[error("Metrics encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    /// Listening socket could not be opened.
    #[error("Failed to bind metrics server to {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Counters exposed by the sidecar.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    log_records: IntCounterVec,
    config_reloads: IntCounter,
    reconcile_errors: IntCounter,
}

impl Metrics {
    /// Create the counters in a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let log_records = IntCounterVec::new(
            Opts::new(
                "poolvisor_log_records_total",
                "Log records read from pgbouncer output",
            ),
            &["pipe", "matched"],
        )?;
        let config_reloads = IntCounter::new(
            "poolvisor_config_reloads_total",
            "Configuration reloads requested from pgbouncer",
        )?;
        let reconcile_errors = IntCounter::new(
            "poolvisor_reconcile_errors_total",
            "Reconciliation passes that failed after retries",
        )?;

        registry.register(Box::new(log_records.clone()))?;
        registry.register(Box::new(config_reloads.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;

        Ok(Self {
            registry,
            log_records,
            config_reloads,
            reconcile_errors,
        })
    }

    /// Underlying registry, for adding more collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count one translated line.
    pub fn record_log_line(&self, pipe: Pipe, matched: bool) {
        self.log_records
            .with_label_values(&[pipe.as_str(), bool_label(matched)])
            .inc();
    }

    /// Translated lines counted so far for `pipe`.
    pub fn log_records(&self, pipe: Pipe, matched: bool) -> u64 {
        self.log_records
            .with_label_values(&[pipe.as_str(), bool_label(matched)])
            .get()
    }

    /// Count one configuration reload.
    pub fn config_reloaded(&self) {
        self.config_reloads.inc();
    }

    /// Configuration reloads counted so far.
    pub fn config_reloads(&self) -> u64 {
        self.config_reloads.get()
    }

    /// Count one failed reconciliation pass.
    pub fn reconcile_failed(&self) {
        self.reconcile_errors.inc();
    }

    /// Failed reconciliation passes counted so far.
    pub fn reconcile_errors(&self) -> u64 {
        self.reconcile_errors.get()
    }

    /// Encode every metric in the text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn bool_label(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Build the metrics router.
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// HTTP server exposing [`Metrics`].
pub struct MetricsServer;

impl MetricsServer {
    /// Bind `addr` and start serving in the background.
    pub async fn start(
        addr: SocketAddr,
        metrics: Metrics,
    ) -> Result<MetricsServerHandle, MetricsError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MetricsError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| MetricsError::Bind { addr, source })?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let app = router(metrics);

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        info!(addr = %local_addr, "Metrics server listening");

        Ok(MetricsServerHandle {
            local_addr,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to a running [`MetricsServer`].
pub struct MetricsServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl MetricsServerHandle {
    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the server task has ended or was shut down.
    pub async fn is_stopped(&self) -> bool {
        match self.task.lock().await.as_ref() {
            Some(task) => task.is_finished(),
            None => true,
        }
    }
}

#[async_trait]
impl MetricsEndpoint for MetricsServerHandle {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        let Some(task) = self.task.lock().await.take() else {
            return Err(ShutdownError::MetricsAlreadyStopped);
        };

        if task.is_finished() {
            // Ended on its own, most likely a serve error; report it as stopped.
            if let Ok(Err(e)) = task.await {
                warn!(error = %e, "Metrics server had already failed");
            }
            return Err(ShutdownError::MetricsAlreadyStopped);
        }

        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(Ok(()))) => {
                info!("Metrics server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(ShutdownError::Metrics(e.to_string())),
            Ok(Err(e)) => Err(ShutdownError::Metrics(format!("server task panicked: {}", e))),
            Err(_) => Err(ShutdownError::Metrics(
                "timed out waiting for in-flight requests".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_log_line(Pipe::Stdout, true);
        metrics.config_reloaded();

        let text = metrics.render().unwrap();
        assert!(text.contains("poolvisor_log_records_total{matched=\"true\",pipe=\"stdout\"} 1"));
        assert!(text.contains("poolvisor_config_reloads_total 1"));
        assert!(text.contains("poolvisor_reconcile_errors_total 0"));
    }

    #[tokio::test]
    async fn test_server_shutdown_twice() {
        let metrics = Metrics::new().unwrap();
        let handle = MetricsServer::start("127.0.0.1:0".parse().unwrap(), metrics)
            .await
            .unwrap();
        assert_ne!(handle.local_addr().port(), 0);

        handle.shutdown().await.unwrap();
        assert!(handle.is_stopped().await);
        assert!(matches!(
            handle.shutdown().await,
            Err(ShutdownError::MetricsAlreadyStopped)
        ));
    }
}
