// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Optimistic-concurrency mutations of the cluster object.
//!
//! Each operation fetches the current state, applies a pure mutation to it
//! and submits the result with the fetched resource version. A conflict
//! restarts the cycle from a fresh fetch under [`RetryPolicy::default_retry`].
//! Validation failures and other store errors end the operation at once.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, info};

use super::state::{FenceTarget, HibernationMode, ObjectKey};
use super::store::{ClusterStore, InstanceLookup, StoreError};
use crate::retry::{ConflictError, RetryPolicy, retry_on_conflict};

/// Errors from cluster state mutations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MutationError {
    /// Instance to promote does not exist.
    #[error("new primary node {instance} not found in namespace {namespace}")]
    InstanceNotFound {
        /// Namespace searched.
        namespace: String,
        /// Instance name.
        instance: String,
    },

    /// Instance is not part of the cluster.
    #[error("node {instance} is not a member of cluster {cluster}")]
    NotAMember {
        /// Cluster name.
        cluster: String,
        /// Instance name.
        instance: String,
    },

    /// Requested value is already set.
    #[error("cluster {cluster} is already in the requested state")]
    AlreadyInRequestedState {
        /// Cluster name.
        cluster: String,
    },

    /// A single instance cannot be unfenced while all instances are fenced.
    #[error("cannot unfence {instance} while all instances are fenced, unfence '*' instead")]
    SingleInstanceUnfencing {
        /// Instance name.
        instance: String,
    },

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConflictError for MutationError {
    fn is_conflict(&self) -> bool {
        matches!(self, MutationError::Store(e) if e.is_conflict())
    }
}

/// Result of a promotion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The target primary was changed and a switchover requested.
    Promoted,
    /// The instance already was the target primary; nothing was written.
    AlreadyPrimary,
}

/// Applies promote, fence and hibernate to clusters in a [`ClusterStore`].
#[derive(Clone)]
pub struct ClusterStateMutator {
    store: Arc<dyn ClusterStore>,
    lookup: Arc<dyn InstanceLookup>,
    policy: RetryPolicy,
}

impl ClusterStateMutator {
    /// Create a mutator using the default conflict retry policy.
    pub fn new(store: Arc<dyn ClusterStore>, lookup: Arc<dyn InstanceLookup>) -> Self {
        Self {
            store,
            lookup,
            policy: RetryPolicy::default_retry(),
        }
    }

    /// Override the conflict retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Request `instance` to become the primary of the cluster at `key`.
    ///
    /// The instance must exist in the cluster's namespace and be one of the
    /// cluster's instances; otherwise nothing is written.
    pub async fn promote(
        &self,
        key: &ObjectKey,
        instance: &str,
    ) -> Result<PromoteOutcome, MutationError> {
        if !self.lookup.instance_exists(&key.namespace, instance).await? {
            return Err(MutationError::InstanceNotFound {
                namespace: key.namespace.clone(),
                instance: instance.to_string(),
            });
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let timestamp = timestamp.as_str();
        let store = &self.store;

        let outcome = retry_on_conflict(&self.policy, move || async move {
            let mut state = store.get(key).await?;
            if !state.promote(instance, timestamp)? {
                return Ok(PromoteOutcome::AlreadyPrimary);
            }
            store.update_status(&state).await?;
            Ok::<_, MutationError>(PromoteOutcome::Promoted)
        })
        .await?;

        info!(cluster = %key, instance, outcome = ?outcome, "Promotion requested");
        Ok(outcome)
    }

    /// Fence `target`. Returns whether the fenced set was written.
    pub async fn fence_on(
        &self,
        key: &ObjectKey,
        target: &FenceTarget,
    ) -> Result<bool, MutationError> {
        let store = &self.store;
        let written = retry_on_conflict(&self.policy, move || async move {
            let mut state = store.get(key).await?;
            if !state.fence(target)? {
                return Ok(false);
            }
            store.update_fenced_instances(&state).await?;
            Ok::<_, MutationError>(true)
        })
        .await?;

        debug!(cluster = %key, target = %target, written, "Fence applied");
        Ok(written)
    }

    /// Unfence `target`. Returns whether the fenced set was written.
    pub async fn fence_off(
        &self,
        key: &ObjectKey,
        target: &FenceTarget,
    ) -> Result<bool, MutationError> {
        let store = &self.store;
        let written = retry_on_conflict(&self.policy, move || async move {
            let mut state = store.get(key).await?;
            if !state.unfence(target)? {
                return Ok(false);
            }
            store.update_fenced_instances(&state).await?;
            Ok::<_, MutationError>(true)
        })
        .await?;

        debug!(cluster = %key, target = %target, written, "Fence removed");
        Ok(written)
    }

    /// Set the hibernation annotation to `mode`.
    ///
    /// Fails with [`MutationError::AlreadyInRequestedState`] when it is
    /// already set to `mode`.
    pub async fn hibernate(
        &self,
        key: &ObjectKey,
        mode: HibernationMode,
    ) -> Result<(), MutationError> {
        let store = &self.store;
        retry_on_conflict(&self.policy, move || async move {
            let mut state = store.get(key).await?;
            state.set_hibernation(mode)?;
            store.patch_hibernation(&state).await?;
            Ok::<_, MutationError>(())
        })
        .await?;

        info!(cluster = %key, mode = %mode, "Hibernation updated");
        Ok(())
    }
}
