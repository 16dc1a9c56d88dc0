// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command dispatch tests against the in-memory cluster store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use poolvisor::{CliError, ClusterBackend, ConfigError, Deps, build_cli, dispatch};
use poolvisor_core::cluster::{
    ClusterState, FENCE_ALL, HibernationMode, MemoryClusterStore, MutationError, ObjectKey,
};
use poolvisor_core::supervisor::SupervisorError;
use tempfile::TempDir;

const NAMESPACE: &str = "db";

fn key() -> ObjectKey {
    ObjectKey::new(NAMESPACE, "pg")
}

async fn store() -> MemoryClusterStore {
    let store = MemoryClusterStore::new();
    let mut state = ClusterState::new(key()).with_instances(["pg-1", "pg-2"]);
    state.target_primary = "pg-1".to_string();
    store.insert(state).await;
    store.add_instance(NAMESPACE, "pg-1").await;
    store.add_instance(NAMESPACE, "pg-2").await;
    store
}

/// Runs one command line and returns what it printed.
async fn run(store: &MemoryClusterStore, args: &[&str]) -> Result<String, CliError> {
    let mut argv = vec!["poolvisor", "--namespace", NAMESPACE];
    argv.extend_from_slice(args);
    let matches = build_cli().try_get_matches_from(argv).unwrap();

    let mut out: Vec<u8> = Vec::new();
    let backend = ClusterBackend::new(Arc::new(store.clone()), Arc::new(store.clone()));
    dispatch(&matches, Deps::with_backend(&mut out, backend)).await?;
    Ok(String::from_utf8(out).unwrap())
}

// ============================================================================
// Cluster commands
// ============================================================================

#[tokio::test]
async fn test_promote_prints_confirmation() {
    let store = store().await;

    let out = run(&store, &["promote", "pg", "pg-2"]).await.unwrap();
    assert_eq!(out, "Node pg-2 in cluster pg will be promoted\n");

    let state = store.state(&key()).await.unwrap();
    assert_eq!(state.target_primary, "pg-2");
}

#[tokio::test]
async fn test_promote_current_primary() {
    let store = store().await;

    let out = run(&store, &["promote", "pg", "pg-1"]).await.unwrap();
    assert_eq!(out, "pg-1 is already the primary node in the cluster\n");
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_promote_unknown_instance_propagates_error() {
    let store = store().await;

    let err = run(&store, &["promote", "pg", "pg-7"]).await.unwrap_err();
    assert!(matches!(
        err,
        CliError::Mutation(MutationError::InstanceNotFound { .. })
    ));
    assert_eq!(
        err.to_string(),
        "new primary node pg-7 not found in namespace db"
    );
}

#[tokio::test]
async fn test_fence_on_and_off() {
    let store = store().await;

    let out = run(&store, &["fence", "on", "pg", "pg-2"]).await.unwrap();
    assert_eq!(out, "pg-2 fenced\n");
    let state = store.state(&key()).await.unwrap();
    assert!(state.fenced_instances.contains("pg-2"));

    let out = run(&store, &["fence", "off", "pg", "pg-2"]).await.unwrap();
    assert_eq!(out, "pg-2 unfenced\n");
    let state = store.state(&key()).await.unwrap();
    assert!(state.fenced_instances.is_empty());
}

#[tokio::test]
async fn test_fence_all() {
    let store = store().await;

    let out = run(&store, &["fence", "on", "pg", "*"]).await.unwrap();
    assert_eq!(out, "* fenced\n");
    let state = store.state(&key()).await.unwrap();
    assert!(state.fenced_instances.contains(FENCE_ALL));

    let err = run(&store, &["fence", "off", "pg", "pg-1"])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CliError::Mutation(MutationError::SingleInstanceUnfencing { .. })
    ));
}

#[tokio::test]
async fn test_fence_non_member() {
    let store = store().await;

    let err = run(&store, &["fence", "on", "pg", "other-1"])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "node other-1 is not a member of cluster pg");
}

#[tokio::test]
async fn test_hibernate_on_twice() {
    let store = store().await;

    let out = run(&store, &["hibernate", "on", "pg"]).await.unwrap();
    assert_eq!(out, "cluster pg hibernation set to on\n");
    let state = store.state(&key()).await.unwrap();
    assert_eq!(state.hibernation, Some(HibernationMode::On));

    let err = run(&store, &["hibernate", "on", "pg"]).await.unwrap_err();
    assert!(matches!(
        err,
        CliError::Mutation(MutationError::AlreadyInRequestedState { .. })
    ));
}

#[tokio::test]
async fn test_backend_error_propagates() {
    let matches = build_cli()
        .try_get_matches_from(["poolvisor", "hibernate", "off", "pg"])
        .unwrap();
    let mut out: Vec<u8> = Vec::new();
    let deps = Deps::new(
        &mut out,
        Box::new(|| -> Result<ClusterBackend, CliError> {
            Err(CliError::Config(ConfigError::MissingEnvVar("NAMESPACE")))
        }),
    );

    let err = dispatch(&matches, deps).await.unwrap_err();
    assert!(matches!(err, CliError::Config(_)));
    assert!(out.is_empty());
}

// ============================================================================
// pgbouncer run
// ============================================================================

/// Source directory whose `pgbouncer.ini` is a shell script, so `/bin/sh`
/// can stand in for PgBouncer.
fn sidecar_dirs(script: &str) -> TempDir {
    let root = TempDir::new().unwrap();
    let source = root.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("pgbouncer.ini"), script).unwrap();
    std::fs::write(source.join("pg_hba.conf"), "local all all trust\n").unwrap();
    std::fs::write(source.join("userlist.txt"), "\"app\" \"secret\"\n").unwrap();
    root
}

fn run_args(root: &Path) -> Vec<String> {
    let path = |name: &str| root.join(name).display().to_string();
    vec![
        "poolvisor".to_string(),
        "--namespace".to_string(),
        NAMESPACE.to_string(),
        "pgbouncer".to_string(),
        "run".to_string(),
        "--pooler-name".to_string(),
        "pooler-rw".to_string(),
        "--pgbouncer-binary".to_string(),
        "/bin/sh".to_string(),
        "--configs-dir".to_string(),
        path("configs"),
        "--socket-dir".to_string(),
        path("run"),
        "--source-dir".to_string(),
        path("source"),
        "--metrics-port".to_string(),
        "0".to_string(),
    ]
}

async fn run_sidecar(root: &TempDir) -> Result<(), CliError> {
    let matches = build_cli()
        .try_get_matches_from(run_args(root.path()))
        .unwrap();
    let mut out: Vec<u8> = Vec::new();
    let deps = Deps::new(
        &mut out,
        Box::new(|| -> Result<ClusterBackend, CliError> {
            panic!("pgbouncer run must not connect to the cluster")
        }),
    );
    tokio::time::timeout(Duration::from_secs(10), dispatch(&matches, deps))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_run_clean_exit() {
    let root = sidecar_dirs("echo '2024-01-01 00:00:00.000 UTC [1] LOG ready'\nexit 0\n");

    run_sidecar(&root).await.unwrap();

    assert!(root.path().join("run").is_dir());
    assert!(root.path().join("configs/pg_hba.conf").is_file());
    assert!(root.path().join("configs/userlist.txt").is_file());
}

#[tokio::test]
async fn test_run_failed_exit_is_an_error() {
    let root = sidecar_dirs("echo 'FATAL cannot load config' >&2\nexit 2\n");

    let err = run_sidecar(&root).await.unwrap_err();
    assert!(matches!(
        err,
        CliError::Pooler(SupervisorError::NonZeroExit(2))
    ));
}

#[tokio::test]
async fn test_run_requires_pooler_name() {
    let root = sidecar_dirs("exit 0\n");
    let mut args = run_args(root.path());
    let at = args.iter().position(|a| a == "--pooler-name").unwrap();
    args.drain(at..at + 2);

    let matches = build_cli().try_get_matches_from(args).unwrap();
    let mut out: Vec<u8> = Vec::new();
    let deps = Deps::new(
        &mut out,
        Box::new(|| -> Result<ClusterBackend, CliError> { panic!("unexpected connect") }),
    );

    // POOLER_NAME may be set in the environment, which clap honours.
    if std::env::var("POOLER_NAME").is_err() {
        let err = dispatch(&matches, deps).await.unwrap_err();
        assert!(matches!(
            err,
            CliError::Config(ConfigError::MissingEnvVar("POOLER_NAME"))
        ));
    }
}
