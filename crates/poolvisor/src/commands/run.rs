// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `pgbouncer run`: the sidecar entry point.
//!
//! Starts the metrics endpoint, prepares the PgBouncer configuration, runs
//! PgBouncer under supervision and blocks until it exits. A failed exit is
//! returned as [`CliError::Pooler`] so the process exits non-zero.

use std::sync::Arc;

use poolvisor_core::metrics::Metrics;
use poolvisor_core::reconciler::{DirectorySource, PoolerReconciler, ReconcilerConfig};
use poolvisor_core::retry::RetryPolicy;
use poolvisor_core::runtime::PoolerRuntime;
use poolvisor_core::supervisor::{CommandSpec, ProcessReport};
use tracing::{error, info};

use crate::{CliError, RunConfig};

/// Run PgBouncer until it exits and fail unless it exited cleanly.
pub async fn execute(config: RunConfig) -> Result<(), CliError> {
    let report = supervise(&config).await?;
    if let Err(e) = report.clone().into_result() {
        error!(pooler = %config.pooler_name, error = %e, "PgBouncer failed");
        return Err(e.into());
    }
    info!(pooler = %config.pooler_name, "PgBouncer exited cleanly");
    Ok(())
}

/// Run PgBouncer until it exits and return its report.
pub async fn supervise(config: &RunConfig) -> Result<ProcessReport, CliError> {
    info!(
        pooler = %config.pooler_name,
        namespace = %config.namespace,
        binary = %config.pgbouncer_binary.display(),
        metrics_addr = %config.metrics_addr(),
        "Starting pgbouncer sidecar"
    );

    let metrics = Metrics::new().map_err(poolvisor_core::Error::from)?;
    let source = DirectorySource::new(&config.source_dir);
    let reconciler = PoolerReconciler::new(
        ReconcilerConfig {
            configs_dir: config.configs_dir.clone(),
            socket_dir: config.socket_dir.clone(),
            interval: config.reconcile_interval,
            retry: RetryPolicy::default_backoff(),
        },
        Arc::new(source),
    )
    .with_metrics(metrics.clone());

    let runtime = PoolerRuntime::builder()
        .command(CommandSpec::new(&config.pgbouncer_binary))
        .config_path(config.config_path())
        .metrics_addr(config.metrics_addr())
        .metrics(metrics)
        .reconciler(Arc::new(reconciler))
        .build()?
        .start()
        .await?;

    info!(
        pid = runtime.process().pid(),
        metrics_addr = %runtime.metrics_addr(),
        "Started pgbouncer"
    );

    let report = runtime.wait().await?;
    info!(termination = %report.termination, "Pgbouncer stopped");
    Ok(report)
}
