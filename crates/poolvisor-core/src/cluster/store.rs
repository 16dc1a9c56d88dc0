// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capabilities consumed by the mutator.

use async_trait::async_trait;
use thiserror::Error;

use super::state::{ClusterState, ObjectKey};

/// Errors from the cluster object store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// Object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write was based on a stale resource version.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store rejected the request.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message returned by the store.
        message: String,
    },

    /// Store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored object could not be interpreted.
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether the error is a stale-write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Read and conditional-write access to cluster objects.
///
/// Every write carries the snapshot's `resource_version` and fails with
/// [`StoreError::Conflict`] when the stored object moved on. Writes return
/// the stored state at its new version.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch the current state of a cluster.
    async fn get(&self, key: &ObjectKey) -> Result<ClusterState, StoreError>;

    /// Write target primary, its timestamp, phase and phase reason.
    async fn update_status(&self, state: &ClusterState) -> Result<ClusterState, StoreError>;

    /// Write the fenced instance set.
    async fn update_fenced_instances(
        &self,
        state: &ClusterState,
    ) -> Result<ClusterState, StoreError>;

    /// Write the hibernation annotation.
    async fn patch_hibernation(&self, state: &ClusterState) -> Result<ClusterState, StoreError>;
}

/// Existence check for a named instance.
#[async_trait]
pub trait InstanceLookup: Send + Sync {
    /// Whether an instance called `name` exists in `namespace`.
    async fn instance_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError>;
}
