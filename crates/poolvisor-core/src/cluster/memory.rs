// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cluster store for testing.
//!
//! Keeps cluster snapshots keyed by [`ObjectKey`] with monotonically
//! increasing resource versions, and can simulate a concurrent writer that
//! sneaks in right before the next write.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::state::{ClusterState, ObjectKey};
use super::store::{ClusterStore, InstanceLookup, StoreError};

type ConcurrentWrite = Box<dyn FnOnce(&mut ClusterState) + Send>;

#[derive(Default)]
struct Inner {
    clusters: HashMap<ObjectKey, ClusterState>,
    instances: HashSet<(String, String)>,
    concurrent: VecDeque<ConcurrentWrite>,
    next_version: u64,
}

impl Inner {
    fn bump(&mut self, state: &mut ClusterState) {
        self.next_version += 1;
        state.resource_version = self.next_version.to_string();
    }

    /// Applies pending concurrent writes, then checks the precondition.
    fn prepare_write(&mut self, state: &ClusterState) -> Result<&mut ClusterState, StoreError> {
        if !self.clusters.contains_key(&state.key) {
            return Err(StoreError::NotFound(format!("cluster {}", state.key)));
        }

        if let Some(write) = self.concurrent.pop_front() {
            let mut current = self.clusters[&state.key].clone();
            write(&mut current);
            self.bump(&mut current);
            self.clusters.insert(state.key.clone(), current);
        }

        let current = self
            .clusters
            .get_mut(&state.key)
            .ok_or_else(|| StoreError::NotFound(format!("cluster {}", state.key)))?;
        if current.resource_version != state.resource_version {
            return Err(StoreError::Conflict(format!(
                "cluster {} was modified (have {}, stored {})",
                state.key, state.resource_version, current.resource_version
            )));
        }
        Ok(current)
    }
}

/// In-memory [`ClusterStore`] and [`InstanceLookup`].
#[derive(Clone, Default)]
pub struct MemoryClusterStore {
    inner: Arc<Mutex<Inner>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryClusterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cluster, assigning a fresh resource version.
    pub async fn insert(&self, mut state: ClusterState) {
        let mut inner = self.inner.lock().await;
        inner.bump(&mut state);
        inner.clusters.insert(state.key.clone(), state);
    }

    /// Register an instance for [`InstanceLookup`].
    pub async fn add_instance(&self, namespace: &str, name: &str) {
        self.inner
            .lock()
            .await
            .instances
            .insert((namespace.to_string(), name.to_string()));
    }

    /// Current stored state of a cluster.
    pub async fn state(&self, key: &ObjectKey) -> Option<ClusterState> {
        self.inner.lock().await.clusters.get(key).cloned()
    }

    /// Number of successful writes made through the [`ClusterStore`] API.
    ///
    /// Simulated concurrent writes are not counted.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Apply `write` as if another client updated the cluster just before
    /// the next write, making that write conflict.
    pub async fn inject_concurrent_write<F>(&self, write: F)
    where
        F: FnOnce(&mut ClusterState) + Send + 'static,
    {
        self.inner.lock().await.concurrent.push_back(Box::new(write));
    }

    /// Make the next `count` writes conflict.
    pub async fn inject_conflicts(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        for _ in 0..count {
            inner.concurrent.push_back(Box::new(|_| {}));
        }
    }

    async fn write_with<F>(&self, state: &ClusterState, apply: F) -> Result<ClusterState, StoreError>
    where
        F: FnOnce(&mut ClusterState, &ClusterState),
    {
        let mut inner = self.inner.lock().await;
        let current = inner.prepare_write(state)?;
        let mut updated = current.clone();
        apply(&mut updated, state);
        inner.bump(&mut updated);
        inner.clusters.insert(state.key.clone(), updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn get(&self, key: &ObjectKey) -> Result<ClusterState, StoreError> {
        self.inner
            .lock()
            .await
            .clusters
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("cluster {}", key)))
    }

    async fn update_status(&self, state: &ClusterState) -> Result<ClusterState, StoreError> {
        self.write_with(state, |stored, desired| {
            stored.target_primary = desired.target_primary.clone();
            stored.target_primary_timestamp = desired.target_primary_timestamp.clone();
            stored.phase = desired.phase.clone();
            stored.phase_reason = desired.phase_reason.clone();
        })
        .await
    }

    async fn update_fenced_instances(
        &self,
        state: &ClusterState,
    ) -> Result<ClusterState, StoreError> {
        self.write_with(state, |stored, desired| {
            stored.fenced_instances = desired.fenced_instances.clone();
        })
        .await
    }

    async fn patch_hibernation(&self, state: &ClusterState) -> Result<ClusterState, StoreError> {
        self.write_with(state, |stored, desired| {
            stored.hibernation = desired.hibernation;
        })
        .await
    }
}

#[async_trait]
impl InstanceLookup for MemoryClusterStore {
    async fn instance_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .instances
            .contains(&(namespace.to_string(), name.to_string())))
    }
}
