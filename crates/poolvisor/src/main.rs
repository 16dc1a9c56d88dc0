// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poolvisor - PgBouncer sidecar and cluster failover commands
//!
//! `poolvisor pgbouncer run` supervises PgBouncer inside a pooler pod. The
//! `promote`, `fence` and `hibernate` commands mutate a cluster through the
//! Kubernetes API.

use tracing::warn;
use tracing_subscriber::EnvFilter;

use poolvisor::{ClusterBackend, Deps, LogFormat, build_cli, dispatch};

const DEFAULT_FILTER: &str =
    "poolvisor=info,poolvisor_core=info,poolvisor_kube=info,pgbouncer=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let requested = std::env::var("POOLVISOR_LOG_FORMAT").ok();
    match LogFormat::select(&matches, requested.as_deref()) {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let mut stdout = std::io::stdout();
    let deps = Deps::new(&mut stdout, Box::new(ClusterBackend::kube_from_env));
    dispatch(&matches, deps).await?;

    Ok(())
}
