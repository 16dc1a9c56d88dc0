// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pooler runtime - the `pgbouncer run` flow as a library.
//!
//! Startup order:
//!
//! 1. metrics endpoint
//! 2. reconciler `init` (writes the configuration, creates the socket directory)
//! 3. pgbouncer child with one translator per output stream
//! 4. reconciler `run` task
//! 5. shutdown coordinator listening for SIGINT and SIGTERM
//!
//! # Example
//!
//! ```ignore
//! use poolvisor_core::runtime::PoolerRuntime;
//! use poolvisor_core::supervisor::CommandSpec;
//!
//! let runtime = PoolerRuntime::builder()
//!     .command(CommandSpec::new("/usr/bin/pgbouncer"))
//!     .config_path("/controller/configs/pgbouncer.ini")
//!     .reconciler(reconciler)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let report = runtime.wait().await?;
//! report.into_result()?;
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::logpipe::{LogRecordTranslator, Pipe, RecordSink, TracingSink};
use crate::metrics::{Metrics, MetricsServer, MetricsServerHandle};
use crate::reconciler::ReconciliationLoop;
use crate::shutdown::{MetricsEndpoint, ShutdownCoordinator, ShutdownError};
use crate::supervisor::{
    CommandSpec, DEFAULT_DRAIN_GRACE, ProcessHandle, ProcessReport, ProcessSupervisor,
    SupervisedProcess,
};

/// Default metrics port of the sidecar.
pub const DEFAULT_METRICS_PORT: u16 = 9127;

/// Builder for a [`PoolerRuntime`].
pub struct PoolerRuntimeBuilder {
    command: Option<CommandSpec>,
    config_path: Option<PathBuf>,
    metrics_addr: SocketAddr,
    metrics: Option<Metrics>,
    reconciler: Option<Arc<dyn ReconciliationLoop>>,
    sink: Option<Arc<dyn RecordSink>>,
    drain_grace: Duration,
    handle_signals: bool,
}

impl Default for PoolerRuntimeBuilder {
    fn default() -> Self {
        Self {
            command: None,
            config_path: None,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            metrics: None,
            reconciler: None,
            sink: None,
            drain_grace: DEFAULT_DRAIN_GRACE,
            handle_signals: true,
        }
    }
}

impl PoolerRuntimeBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the child command (required).
    pub fn command(mut self, command: CommandSpec) -> Self {
        self.command = Some(command);
        self
    }

    /// Configuration file passed as the last argument of the command.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set the metrics bind address.
    ///
    /// Default: `0.0.0.0:9127`
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = addr;
        self
    }

    /// Use an existing metrics registry.
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the reconciliation loop (required).
    pub fn reconciler(mut self, reconciler: Arc<dyn ReconciliationLoop>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Set the record sink.
    ///
    /// Default: [`TracingSink`] counting into the metrics registry.
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set how long output is drained after the child exits.
    ///
    /// Default: 100ms
    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Whether to install SIGINT and SIGTERM listeners.
    ///
    /// Default: `true`
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> Result<PoolerRuntimeConfig> {
        let mut command = self.command.ok_or(Error::MissingComponent("command"))?;
        let reconciler = self
            .reconciler
            .ok_or(Error::MissingComponent("reconciler"))?;
        if let Some(path) = self.config_path {
            command = command.arg(path.display().to_string());
        }

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Metrics::new()?,
        };
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingSink::new().with_metrics(metrics.clone())));

        Ok(PoolerRuntimeConfig {
            command,
            metrics_addr: self.metrics_addr,
            metrics,
            reconciler,
            sink,
            drain_grace: self.drain_grace,
            handle_signals: self.handle_signals,
        })
    }
}

/// Validated runtime configuration.
pub struct PoolerRuntimeConfig {
    command: CommandSpec,
    metrics_addr: SocketAddr,
    metrics: Metrics,
    reconciler: Arc<dyn ReconciliationLoop>,
    sink: Arc<dyn RecordSink>,
    drain_grace: Duration,
    handle_signals: bool,
}

impl PoolerRuntimeConfig {
    /// Command that will be started.
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Start every part in order.
    ///
    /// Parts already started are stopped again when a later step fails.
    pub async fn start(self) -> Result<PoolerRuntime> {
        let root = CancellationToken::new();

        let metrics_server =
            Arc::new(MetricsServer::start(self.metrics_addr, self.metrics).await?);

        if let Err(e) = self.reconciler.init(&root).await {
            error!(error = %e, "Reconciler initialization failed");
            stop_metrics(&metrics_server).await;
            return Err(e.into());
        }

        let supervisor = ProcessSupervisor::new().with_drain_grace(self.drain_grace);
        let process = match supervisor.spawn(
            &self.command,
            LogRecordTranslator::new(Pipe::Stdout, self.sink.clone()),
            LogRecordTranslator::new(Pipe::Stderr, self.sink.clone()),
        ) {
            Ok(process) => process,
            Err(e) => {
                error!(error = %e, "Failed to start pgbouncer");
                stop_metrics(&metrics_server).await;
                return Err(e.into());
            }
        };

        let handle = process.handle();
        self.reconciler.attach_child(handle.clone());

        let reconciler_task = {
            let reconciler = self.reconciler.clone();
            let cancel = root.clone();
            tokio::spawn(async move { reconciler.run(cancel).await })
        };

        let coordinator = ShutdownCoordinator::new(
            metrics_server.clone(),
            self.reconciler.clone(),
            Arc::new(handle.clone()),
            root.clone(),
        );
        let signal_task = if self.handle_signals {
            match coordinator.register() {
                Ok(task) => Some(task),
                Err(e) => {
                    error!(error = %e, "Failed to register shutdown handler");
                    coordinator.trigger().await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        info!(
            pid = handle.pid(),
            metrics_addr = %metrics_server.local_addr(),
            "Pooler runtime started"
        );

        Ok(PoolerRuntime {
            process,
            handle,
            root,
            coordinator,
            metrics_server,
            reconciler: self.reconciler,
            reconciler_task,
            signal_task,
        })
    }
}

async fn stop_metrics(server: &MetricsServerHandle) {
    match server.shutdown().await {
        Ok(()) | Err(ShutdownError::MetricsAlreadyStopped) => {}
        Err(e) => warn!(error = %e, "Failed to stop metrics server"),
    }
}

/// A running pooler sidecar.
pub struct PoolerRuntime {
    process: SupervisedProcess,
    handle: ProcessHandle,
    root: CancellationToken,
    coordinator: Arc<ShutdownCoordinator>,
    metrics_server: Arc<MetricsServerHandle>,
    reconciler: Arc<dyn ReconciliationLoop>,
    reconciler_task: JoinHandle<()>,
    signal_task: Option<JoinHandle<()>>,
}

impl PoolerRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> PoolerRuntimeBuilder {
        PoolerRuntimeBuilder::new()
    }

    /// Handle of the pgbouncer child.
    pub fn process(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Address the metrics endpoint is bound to.
    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_server.local_addr()
    }

    /// Root token, cancelled when shutdown completes or the child exits.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Run the shutdown sequence as if a termination signal arrived.
    pub async fn shutdown(&self) -> bool {
        self.coordinator.trigger().await
    }

    /// Wait for the child to exit, then tear everything else down.
    ///
    /// The report is returned as is; judging it is up to the caller.
    pub async fn wait(self) -> Result<ProcessReport> {
        let report = self.process.wait().await;

        self.root.cancel();
        self.reconciler.stop();

        if let Err(e) = self.reconciler_task.await {
            error!(error = %e, "Reconciler task panicked");
        }
        stop_metrics(&self.metrics_server).await;
        if let Some(task) = self.signal_task
            && let Err(e) = task.await
        {
            error!(error = %e, "Signal listener panicked");
        }

        debug!("Pooler runtime stopped");
        Ok(report?)
    }
}
