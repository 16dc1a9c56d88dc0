// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered shutdown on SIGINT or SIGTERM.
//!
//! The first termination signal runs the sequence once:
//!
//! 1. shut the metrics endpoint down,
//! 2. stop the reconciliation loop,
//! 3. send SIGINT to the child if it still runs,
//! 4. cancel the root token.
//!
//! A failing step is logged and the sequence moves on. Later signals are
//! logged and ignored. The coordinator never exits the process; the entry
//! point does that once the child's report arrives.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconciler::ReconciliationLoop;
use crate::supervisor::{ProcessHandle, SupervisorError};

/// Errors from shutdown coordination.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShutdownError {
    /// Signal listeners were already installed for this coordinator.
    #[error("Shutdown signal handler already registered")]
    AlreadyRegistered,

    /// Installing a signal listener failed.
    #[error("Failed to install signal handler: {0}")]
    SignalInstall(#[source] io::Error),

    /// Metrics endpoint was already stopped.
    #[error("Metrics server already stopped")]
    MetricsAlreadyStopped,

    /// Metrics endpoint failed while stopping.
    #[error("Metrics server shutdown failed: {0}")]
    Metrics(String),
}

/// Endpoint stopped first during shutdown.
#[async_trait]
pub trait MetricsEndpoint: Send + Sync {
    /// Stop serving.
    async fn shutdown(&self) -> Result<(), ShutdownError>;
}

/// Process interrupted during shutdown.
pub trait InterruptTarget: Send + Sync {
    /// Whether the process still runs.
    fn is_running(&self) -> bool;

    /// Ask the process to stop. `Ok(false)` means it was already gone.
    fn interrupt(&self) -> Result<bool, SupervisorError>;
}

impl InterruptTarget for ProcessHandle {
    fn is_running(&self) -> bool {
        ProcessHandle::is_running(self)
    }

    fn interrupt(&self) -> Result<bool, SupervisorError> {
        ProcessHandle::interrupt(self)
    }
}

/// Runs the shutdown sequence on the first termination signal.
pub struct ShutdownCoordinator {
    metrics: Arc<dyn MetricsEndpoint>,
    reconciler: Arc<dyn ReconciliationLoop>,
    target: Arc<dyn InterruptTarget>,
    root: CancellationToken,
    registered: AtomicBool,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    /// Create a coordinator for the given parts.
    pub fn new(
        metrics: Arc<dyn MetricsEndpoint>,
        reconciler: Arc<dyn ReconciliationLoop>,
        target: Arc<dyn InterruptTarget>,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            metrics,
            reconciler,
            target,
            root,
            registered: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// Install SIGINT and SIGTERM listeners.
    ///
    /// The listener task ends once the root token is cancelled. Can be
    /// called once per coordinator.
    pub fn register(self: &Arc<Self>) -> Result<JoinHandle<()>, ShutdownError> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyRegistered);
        }

        let mut sigint = signal(SignalKind::interrupt()).map_err(ShutdownError::SignalInstall)?;
        let mut sigterm =
            signal(SignalKind::terminate()).map_err(ShutdownError::SignalInstall)?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    biased;
                    _ = this.root.cancelled() => break,
                    Some(()) = sigint.recv() => "SIGINT",
                    Some(()) = sigterm.recv() => "SIGTERM",
                    else => break,
                };

                info!(signal = name, "Received termination signal");
                // The sequence runs on its own task so later signals are
                // still received and reported while it is in progress.
                let coordinator = this.clone();
                tokio::spawn(async move {
                    if !coordinator.trigger().await {
                        warn!(signal = name, "Shutdown already in progress, ignoring signal");
                    }
                });
            }
            debug!("Signal listener stopped");
        });

        info!("Shutdown signal handler registered");
        Ok(handle)
    }

    /// Whether the shutdown sequence has started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run the shutdown sequence.
    ///
    /// Returns `false` without doing anything when it already started.
    pub async fn trigger(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("Shutdown sequence started");

        if let Err(e) = self.metrics.shutdown().await {
            error!(error = %e, "Failed to shut down metrics endpoint");
        }

        self.reconciler.stop();

        if self.target.is_running() {
            match self.target.interrupt() {
                Ok(true) => info!("Sent SIGINT to pgbouncer"),
                Ok(false) => debug!("pgbouncer exited before SIGINT was sent"),
                Err(e) => error!(error = %e, "Failed to interrupt pgbouncer"),
            }
        }

        self.root.cancel();
        info!("Shutdown sequence finished");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcileError;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Endpoint {
        log: Log,
        fail: bool,
    }

    #[async_trait]
    impl MetricsEndpoint for Endpoint {
        async fn shutdown(&self) -> Result<(), ShutdownError> {
            self.log.lock().unwrap().push("metrics");
            if self.fail {
                Err(ShutdownError::Metrics("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Loop {
        log: Log,
    }

    #[async_trait]
    impl ReconciliationLoop for Loop {
        async fn init(&self, _cancel: &CancellationToken) -> Result<(), ReconcileError> {
            Ok(())
        }

        async fn run(&self, cancel: CancellationToken) {
            cancel.cancelled().await;
        }

        fn stop(&self) {
            self.log.lock().unwrap().push("loop");
        }
    }

    struct Child {
        log: Log,
        running: bool,
    }

    impl InterruptTarget for Child {
        fn is_running(&self) -> bool {
            self.running
        }

        fn interrupt(&self) -> Result<bool, SupervisorError> {
            self.log.lock().unwrap().push("child");
            Ok(true)
        }
    }

    fn coordinator(fail_metrics: bool, running: bool) -> (Arc<ShutdownCoordinator>, Log, CancellationToken) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let root = CancellationToken::new();
        let coordinator = ShutdownCoordinator::new(
            Arc::new(Endpoint {
                log: log.clone(),
                fail: fail_metrics,
            }),
            Arc::new(Loop { log: log.clone() }),
            Arc::new(Child {
                log: log.clone(),
                running,
            }),
            root.clone(),
        );
        (coordinator, log, root)
    }

    #[tokio::test]
    async fn test_sequence_order() {
        let (coordinator, log, root) = coordinator(false, true);
        assert!(coordinator.trigger().await);
        assert_eq!(*log.lock().unwrap(), vec!["metrics", "loop", "child"]);
        assert!(root.is_cancelled());
    }

    #[tokio::test]
    async fn test_sequence_continues_after_metrics_failure() {
        let (coordinator, log, root) = coordinator(true, true);
        assert!(coordinator.trigger().await);
        assert_eq!(*log.lock().unwrap(), vec!["metrics", "loop", "child"]);
        assert!(root.is_cancelled());
    }

    #[tokio::test]
    async fn test_exited_child_is_not_interrupted() {
        let (coordinator, log, _root) = coordinator(false, false);
        coordinator.trigger().await;
        assert_eq!(*log.lock().unwrap(), vec!["metrics", "loop"]);
    }

    #[tokio::test]
    async fn test_trigger_runs_once() {
        let (coordinator, log, _root) = coordinator(false, true);
        assert!(coordinator.trigger().await);
        assert!(!coordinator.trigger().await);
        assert!(coordinator.is_started());
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let (coordinator, _log, root) = coordinator(false, true);
        let listener = coordinator.register().unwrap();
        assert!(matches!(
            coordinator.register(),
            Err(ShutdownError::AlreadyRegistered)
        ));
        root.cancel();
        listener.await.unwrap();
    }
}
