// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation module - keeps PgBouncer's configuration in sync.
//!
//! [`ReconciliationLoop`] is the contract the runtime and the shutdown
//! coordinator rely on. [`PoolerReconciler`] is the implementation used by
//! `pgbouncer run`.

mod pooler;
mod source;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::supervisor::{ProcessHandle, SupervisorError};

pub use pooler::{PoolerReconciler, ReconcilerConfig};
pub use source::{CONFIG_FILES, ConfigFile, ConfigSource, DirectorySource};

/// Errors from reconciliation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// Reading the desired configuration failed.
    #[error("Failed to read desired configuration {path}: {source}")]
    Source {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Writing the configuration or creating a directory failed.
    #[error("Failed to write {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Asking the pooler to reload failed.
    #[error("Failed to reload pgbouncer: {0}")]
    Reload(#[from] SupervisorError),

    /// Reconciliation was cancelled before it completed.
    #[error("Reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Source { .. } | ReconcileError::Io { .. })
    }
}

/// Long-running loop that keeps local state in line with a desired state.
#[async_trait]
pub trait ReconciliationLoop: Send + Sync {
    /// One-time setup before the child starts.
    async fn init(&self, cancel: &CancellationToken) -> Result<(), ReconcileError>;

    /// Run until `cancel` fires or [`stop`](Self::stop) is called.
    async fn run(&self, cancel: CancellationToken);

    /// Ask [`run`](Self::run) to return. Idempotent and non-blocking.
    fn stop(&self);

    /// Called once the child is running.
    fn attach_child(&self, _handle: ProcessHandle) {}
}

/// Process that can be asked to reload its configuration.
pub trait ReloadTarget: Send + Sync {
    /// Request a reload. `Ok(false)` means the process is gone.
    fn reload(&self) -> Result<bool, SupervisorError>;
}

impl ReloadTarget for ProcessHandle {
    fn reload(&self) -> Result<bool, SupervisorError> {
        ProcessHandle::reload(self)
    }
}
