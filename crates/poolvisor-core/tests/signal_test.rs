// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shutdown driven by real termination signals sent to this process.
//!
//! Kept in its own test binary: the signals reach every thread of the
//! process, so other tests must not share it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use poolvisor_core::reconciler::{ReconcileError, ReconciliationLoop};
use poolvisor_core::shutdown::{
    InterruptTarget, MetricsEndpoint, ShutdownCoordinator, ShutdownError,
};
use poolvisor_core::supervisor::SupervisorError;
use tokio_util::sync::CancellationToken;

type Steps = Arc<Mutex<Vec<&'static str>>>;

/// Records the call, then holds the sequence until released.
struct GatedMetrics {
    steps: Steps,
    release: CancellationToken,
}

#[async_trait]
impl MetricsEndpoint for GatedMetrics {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.steps.lock().unwrap().push("metrics");
        self.release.cancelled().await;
        Ok(())
    }
}

struct RecordingLoop {
    steps: Steps,
}

#[async_trait]
impl ReconciliationLoop for RecordingLoop {
    async fn init(&self, _cancel: &CancellationToken) -> Result<(), ReconcileError> {
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) {
        cancel.cancelled().await;
    }

    fn stop(&self) {
        self.steps.lock().unwrap().push("loop");
    }
}

struct RecordingChild {
    steps: Steps,
}

impl InterruptTarget for RecordingChild {
    fn is_running(&self) -> bool {
        true
    }

    fn interrupt(&self) -> Result<bool, SupervisorError> {
        self.steps.lock().unwrap().push("child");
        Ok(true)
    }
}

fn send(sig: Signal) {
    kill(Pid::from_raw(std::process::id() as i32), sig).unwrap();
}

async fn wait_for_step(steps: &Steps, step: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !steps.lock().unwrap().iter().any(|s| *s == step) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_sigterm_runs_sequence_once() {
    let steps: Steps = Arc::new(Mutex::new(Vec::new()));
    let release = CancellationToken::new();
    let root = CancellationToken::new();

    let coordinator = ShutdownCoordinator::new(
        Arc::new(GatedMetrics {
            steps: steps.clone(),
            release: release.clone(),
        }),
        Arc::new(RecordingLoop {
            steps: steps.clone(),
        }),
        Arc::new(RecordingChild {
            steps: steps.clone(),
        }),
        root.clone(),
    );
    let listener = coordinator.register().unwrap();

    send(Signal::SIGTERM);
    wait_for_step(&steps, "metrics").await;
    assert!(coordinator.is_started());

    // Arrives while the first sequence is still in progress.
    send(Signal::SIGINT);
    tokio::time::sleep(Duration::from_millis(100)).await;
    release.cancel();

    tokio::time::timeout(Duration::from_secs(5), root.cancelled())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();

    // Handlers stay installed, so a late signal neither kills the process
    // nor restarts the sequence.
    send(Signal::SIGTERM);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*steps.lock().unwrap(), vec!["metrics", "loop", "child"]);
}
