// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poolvisor Core - PgBouncer Sidecar Supervision
//!
//! This crate contains the moving parts of the PgBouncer sidecar and of the
//! operator commands that change a PostgreSQL cluster's failover state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          PoolerRuntime                                   │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌────────────────────────────┐  │
//! │  │  Metrics    │  │  Reconciliation  │  │    ProcessSupervisor       │  │
//! │  │  Endpoint   │  │      Loop        │  │  (pgbouncer child)         │  │
//! │  └──────▲──────┘  └────────▲─────────┘  └──────┬──────────────┬──────┘  │
//! │         │ (1) shutdown     │ (2) stop          │ stdout       │ stderr  │
//! │  ┌──────┴──────────────────┴─────────┐   ┌─────▼─────┐  ┌─────▼─────┐   │
//! │  │        ShutdownCoordinator        │   │Translator │  │Translator │   │
//! │  │  SIGINT / SIGTERM  (3) interrupt ─┼─► └─────┬─────┘  └─────┬─────┘   │
//! │  └───────────────────────────────────┘         └──► RecordSink ◄┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  promote / fence / hibernate ──► ClusterStateMutator ──► ClusterStore   │
//! │                                  (fetch, mutate, submit, retry)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`logpipe`]: line-oriented translation of child output into records
//! - [`supervisor`]: spawning and waiting on the pgbouncer process
//! - [`shutdown`]: ordered, best-effort shutdown on termination signals
//! - [`reconciler`]: reconciliation loop contract and the file-based reconciler
//! - [`metrics`]: Prometheus endpoint
//! - [`retry`]: backoff policies and the retry combinator
//! - [`cluster`]: cluster state model, store capabilities and the mutator
//! - [`runtime`]: wiring of the `pgbouncer run` flow

#![deny(missing_docs)]

/// Error types shared across the crate.
pub mod error;

/// Translation of child process output into structured log records.
pub mod logpipe;

/// Spawning, draining and waiting on the supervised process.
pub mod supervisor;

/// Termination signal handling and the ordered shutdown sequence.
pub mod shutdown;

/// Reconciliation loop contract and the file-based PgBouncer reconciler.
pub mod reconciler;

/// Prometheus metrics endpoint.
pub mod metrics;

/// Backoff policies and the retry-while combinator.
pub mod retry;

/// Cluster state model, store capabilities and the optimistic-concurrency mutator.
pub mod cluster;

/// Wiring of metrics, reconciler, supervisor and shutdown into one runtime.
pub mod runtime;

pub use error::{Error, Result};
