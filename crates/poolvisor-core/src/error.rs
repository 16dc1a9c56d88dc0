// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for poolvisor-core.

use thiserror::Error;

/// Crate-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Supervised process could not be started or waited on.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// Shutdown coordination failed.
    #[error("Shutdown error: {0}")]
    Shutdown(#[from] crate::shutdown::ShutdownError),

    /// Reconciliation loop failed.
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] crate::reconciler::ReconcileError),

    /// Metrics endpoint failed.
    #[error("Metrics error: {0}")]
    Metrics(#[from] crate::metrics::MetricsError),

    /// Cluster object store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::cluster::StoreError),

    /// Cluster state mutation was rejected or failed.
    #[error(transparent)]
    Mutation(#[from] crate::cluster::MutationError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A required runtime component was not provided.
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),
}

/// Result type using the crate-level Error.
pub type Result<T> = std::result::Result<T, Error>;
