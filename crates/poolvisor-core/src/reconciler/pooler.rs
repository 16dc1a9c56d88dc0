// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File-based PgBouncer reconciler.
//!
//! Each pass reads the desired files from a [`ConfigSource`], writes the
//! ones whose contents differ into the configuration directory and, when
//! anything changed after the child started, sends it one SIGHUP so it
//! reloads. A reload that fails stays pending and is sent again by the next
//! pass even when no file changed. A pass that fails is retried with
//! [`RetryPolicy::default_backoff`] and then logged; the loop keeps going.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::source::{ConfigFile, ConfigSource};
use super::{ReconcileError, ReconciliationLoop, ReloadTarget};
use crate::metrics::Metrics;
use crate::retry::{RetryPolicy, retry_on};
use crate::supervisor::ProcessHandle;

/// Configuration for the pooler reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Directory PgBouncer reads its configuration from.
    pub configs_dir: PathBuf,
    /// Directory PgBouncer creates its unix socket in.
    pub socket_dir: PathBuf,
    /// Time between passes.
    pub interval: Duration,
    /// Retry policy for a failing pass.
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            configs_dir: PathBuf::from("/controller/configs"),
            socket_dir: PathBuf::from("/controller/run"),
            interval: Duration::from_secs(30),
            retry: RetryPolicy::default_backoff(),
        }
    }
}

/// Reconciler writing PgBouncer configuration files and triggering reloads.
pub struct PoolerReconciler {
    config: ReconcilerConfig,
    source: Arc<dyn ConfigSource>,
    reload_target: Mutex<Option<Arc<dyn ReloadTarget>>>,
    /// Set when files changed, cleared once the reload went through.
    reload_pending: AtomicBool,
    metrics: Option<Metrics>,
    stopped: CancellationToken,
}

impl PoolerReconciler {
    /// Create a reconciler reading from `source`.
    pub fn new(config: ReconcilerConfig, source: Arc<dyn ConfigSource>) -> Self {
        Self {
            config,
            source,
            reload_target: Mutex::new(None),
            reload_pending: AtomicBool::new(false),
            metrics: None,
            stopped: CancellationToken::new(),
        }
    }

    /// Count reloads and failed passes.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process to reload after configuration changes.
    pub fn set_reload_target(&self, target: Arc<dyn ReloadTarget>) {
        *self
            .reload_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(target);
    }

    /// Path of the main configuration file.
    pub fn config_path(&self) -> PathBuf {
        self.config.configs_dir.join("pgbouncer.ini")
    }

    /// Run one pass with retries. Returns the number of files written.
    pub async fn reconcile(&self) -> Result<usize, ReconcileError> {
        let result = retry_on(&self.config.retry, ReconcileError::is_transient, || {
            self.sync_once()
        })
        .await;

        if result.is_err()
            && let Some(metrics) = &self.metrics
        {
            metrics.reconcile_failed();
        }
        result
    }

    async fn sync_once(&self) -> Result<usize, ReconcileError> {
        let desired = self.source.desired_files().await?;

        let mut written = 0;
        for file in &desired {
            if self.write_if_changed(file).await? {
                written += 1;
            }
        }

        if written > 0 {
            self.reload_pending.store(true, Ordering::SeqCst);
        }
        if self.reload_pending.load(Ordering::SeqCst) {
            self.request_reload()?;
            self.reload_pending.store(false, Ordering::SeqCst);
        }
        Ok(written)
    }

    async fn write_if_changed(&self, file: &ConfigFile) -> Result<bool, ReconcileError> {
        let path = self.config.configs_dir.join(&file.name);
        match tokio::fs::read(&path).await {
            Ok(current) if current == file.contents => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ReconcileError::Io { path, source }),
        }

        write_atomically(&path, &file.contents).await?;
        info!(file = %path.display(), bytes = file.contents.len(), "Configuration file updated");
        Ok(true)
    }

    fn request_reload(&self) -> Result<(), ReconcileError> {
        let target = self
            .reload_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(target) = target else {
            debug!("Configuration written before pgbouncer started, no reload needed");
            return Ok(());
        };

        if target.reload()? {
            info!("Sent SIGHUP to pgbouncer to reload configuration");
            if let Some(metrics) = &self.metrics {
                metrics.config_reloaded();
            }
        } else {
            warn!("pgbouncer is not running, skipping reload");
        }
        Ok(())
    }
}

/// Writes into a sibling temporary file and renames it over `path`, so
/// PgBouncer never reads a half-written file.
async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), ReconcileError> {
    let io_err = |source| ReconcileError::Io {
        path: path.to_path_buf(),
        source,
    };

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
    tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

async fn ensure_dir(path: &Path) -> Result<(), ReconcileError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl ReconciliationLoop for PoolerReconciler {
    async fn init(&self, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        ensure_dir(&self.config.socket_dir).await?;
        ensure_dir(&self.config.configs_dir).await?;

        let written = tokio::select! {
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            written = self.reconcile() => written?,
        };

        info!(
            configs_dir = %self.config.configs_dir.display(),
            socket_dir = %self.config.socket_dir.display(),
            files_written = written,
            "Reconciler initialized"
        );
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = self.stopped.cancelled() => {
                    info!("Reconciler stopped");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation error");
                    }
                }
            }
        }

        info!("Reconciler exited");
    }

    fn stop(&self) {
        self.stopped.cancel();
    }

    fn attach_child(&self, handle: ProcessHandle) {
        self.set_reload_target(Arc::new(handle));
    }
}
