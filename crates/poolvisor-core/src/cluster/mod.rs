// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster module - failover state of a managed PostgreSQL cluster.
//!
//! The cluster object lives in an external store shared with other
//! writers (the operator, other administrators). Changes follow a
//! fetch, mutate, submit cycle with the fetched resource version as the
//! precondition, retried on conflict.

pub mod memory;
mod mutator;
mod state;
mod store;

pub use memory::MemoryClusterStore;
pub use mutator::{ClusterStateMutator, MutationError, PromoteOutcome};
pub use state::{ClusterPhase, ClusterState, FENCE_ALL, FenceTarget, HibernationMode, ObjectKey};
pub use store::{ClusterStore, InstanceLookup, StoreError};
