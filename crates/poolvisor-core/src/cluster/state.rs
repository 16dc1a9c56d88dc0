// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster state snapshot and the pure mutations applied to it.
//!
//! Every mutation works on a freshly fetched [`ClusterState`] and reports
//! whether it changed anything, so the caller can skip the write when it
//! did not.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::mutator::MutationError;

/// Marker that fences every instance of a cluster.
pub const FENCE_ALL: &str = "*";

/// Namespaced name of a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace the object lives in.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Build a key from namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Cluster lifecycle phase.
///
/// Only the switchover phase is interpreted; every other phase is kept
/// verbatim so it round-trips through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterPhase {
    /// A new primary has been requested and the switchover is underway.
    Switchover,
    /// Any other phase string.
    Other(String),
}

impl ClusterPhase {
    const SWITCHOVER: &'static str = "Switchover in progress";

    /// Wire spelling of the phase.
    pub fn as_str(&self) -> &str {
        match self {
            ClusterPhase::Switchover => Self::SWITCHOVER,
            ClusterPhase::Other(phase) => phase,
        }
    }

    /// Parse the wire spelling of a phase.
    pub fn from_wire(phase: &str) -> Self {
        if phase == Self::SWITCHOVER {
            ClusterPhase::Switchover
        } else {
            ClusterPhase::Other(phase.to_string())
        }
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the hibernation annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HibernationMode {
    /// Cluster should be shut down while keeping its storage.
    On,
    /// Cluster should run.
    Off,
}

impl HibernationMode {
    /// Annotation value.
    pub fn as_str(&self) -> &'static str {
        match self {
            HibernationMode::On => "on",
            HibernationMode::Off => "off",
        }
    }
}

impl fmt::Display for HibernationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HibernationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(HibernationMode::On),
            "off" => Ok(HibernationMode::Off),
            other => Err(format!("invalid hibernation mode '{}', expected on or off", other)),
        }
    }
}

/// Instance selection for fencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceTarget {
    /// Every instance, spelled `*`.
    All,
    /// One named instance.
    Instance(String),
}

impl FenceTarget {
    /// Parse a command-line argument, mapping `*` to [`FenceTarget::All`].
    pub fn parse(value: &str) -> Self {
        if value == FENCE_ALL {
            FenceTarget::All
        } else {
            FenceTarget::Instance(value.to_string())
        }
    }

    /// Name stored in the fenced set.
    pub fn as_str(&self) -> &str {
        match self {
            FenceTarget::All => FENCE_ALL,
            FenceTarget::Instance(name) => name,
        }
    }
}

impl fmt::Display for FenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the parts of a cluster object this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterState {
    /// Namespace and name.
    pub key: ObjectKey,
    /// Version the snapshot was read at; writes are rejected once it is stale.
    pub resource_version: String,
    /// Instance requested to be primary. Empty when unset.
    pub target_primary: String,
    /// RFC 3339 time the target primary was last set.
    pub target_primary_timestamp: String,
    /// Current phase, if any.
    pub phase: Option<ClusterPhase>,
    /// Human-readable reason for the phase.
    pub phase_reason: String,
    /// Instances that belong to the cluster.
    pub instance_names: BTreeSet<String>,
    /// Fenced instances; may contain [`FENCE_ALL`].
    pub fenced_instances: BTreeSet<String>,
    /// Hibernation annotation; `None` means not hibernating.
    pub hibernation: Option<HibernationMode>,
}

impl ClusterState {
    /// Empty snapshot for `key`.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            resource_version: String::new(),
            target_primary: String::new(),
            target_primary_timestamp: String::new(),
            phase: None,
            phase_reason: String::new(),
            instance_names: BTreeSet::new(),
            fenced_instances: BTreeSet::new(),
            hibernation: None,
        }
    }

    /// Add instance names, builder style.
    pub fn with_instances<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instance_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Whether every instance is fenced.
    pub fn all_fenced(&self) -> bool {
        self.fenced_instances.contains(FENCE_ALL)
    }

    /// Request `instance` to become primary.
    ///
    /// Returns `false` without touching anything when it already is the
    /// target primary. Fails for a name outside `instance_names`.
    pub fn promote(&mut self, instance: &str, timestamp: &str) -> Result<bool, MutationError> {
        if !self.instance_names.contains(instance) {
            return Err(self.not_a_member(instance));
        }
        if self.target_primary == instance {
            return Ok(false);
        }
        self.target_primary = instance.to_string();
        self.target_primary_timestamp = timestamp.to_string();
        self.phase = Some(ClusterPhase::Switchover);
        self.phase_reason = format!("Switching over to {}", instance);
        Ok(true)
    }

    /// Fence `target`. Returns whether the fenced set changed.
    pub fn fence(&mut self, target: &FenceTarget) -> Result<bool, MutationError> {
        match target {
            FenceTarget::All => {
                if self.all_fenced() {
                    return Ok(false);
                }
                self.fenced_instances.clear();
                self.fenced_instances.insert(FENCE_ALL.to_string());
                Ok(true)
            }
            FenceTarget::Instance(name) => {
                if !self.instance_names.contains(name) {
                    return Err(self.not_a_member(name));
                }
                if self.all_fenced() {
                    return Ok(false);
                }
                Ok(self.fenced_instances.insert(name.clone()))
            }
        }
    }

    /// Unfence `target`. Returns whether the fenced set changed.
    ///
    /// A name that is no longer a member can still be unfenced as long as
    /// it is in the fenced set.
    pub fn unfence(&mut self, target: &FenceTarget) -> Result<bool, MutationError> {
        match target {
            FenceTarget::All => {
                if self.fenced_instances.is_empty() {
                    return Ok(false);
                }
                self.fenced_instances.clear();
                Ok(true)
            }
            FenceTarget::Instance(name) => {
                if !self.instance_names.contains(name) && !self.fenced_instances.contains(name) {
                    return Err(self.not_a_member(name));
                }
                if self.all_fenced() {
                    return Err(MutationError::SingleInstanceUnfencing {
                        instance: name.clone(),
                    });
                }
                Ok(self.fenced_instances.remove(name))
            }
        }
    }

    /// Set the hibernation annotation.
    ///
    /// Fails when the annotation already holds `mode`.
    pub fn set_hibernation(&mut self, mode: HibernationMode) -> Result<(), MutationError> {
        if self.hibernation == Some(mode) {
            return Err(MutationError::AlreadyInRequestedState {
                cluster: self.key.name.clone(),
            });
        }
        self.hibernation = Some(mode);
        Ok(())
    }

    fn not_a_member(&self, instance: &str) -> MutationError {
        MutationError::NotAMember {
            cluster: self.key.name.clone(),
            instance: instance.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterState {
        ClusterState::new(ObjectKey::new("default", "pg")).with_instances(["pg-1", "pg-2", "pg-3"])
    }

    #[test]
    fn test_phase_wire_spelling() {
        assert_eq!(ClusterPhase::Switchover.as_str(), "Switchover in progress");
        assert_eq!(
            ClusterPhase::from_wire("Switchover in progress"),
            ClusterPhase::Switchover
        );
        assert_eq!(
            ClusterPhase::from_wire("Cluster in healthy state"),
            ClusterPhase::Other("Cluster in healthy state".to_string())
        );
    }

    #[test]
    fn test_promote_sets_switchover() {
        let mut state = cluster();
        assert!(state.promote("pg-2", "2024-01-01T00:00:00.000000Z").unwrap());
        assert_eq!(state.target_primary, "pg-2");
        assert_eq!(state.target_primary_timestamp, "2024-01-01T00:00:00.000000Z");
        assert_eq!(state.phase, Some(ClusterPhase::Switchover));
        assert_eq!(state.phase_reason, "Switching over to pg-2");
    }

    #[test]
    fn test_promote_current_primary_is_noop() {
        let mut state = cluster();
        state.target_primary = "pg-1".to_string();
        let before = state.clone();
        assert!(!state.promote("pg-1", "later").unwrap());
        assert_eq!(state, before);
    }

    #[test]
    fn test_promote_non_member_is_rejected() {
        let mut state = cluster();
        let before = state.clone();
        let err = state.promote("other-1", "later").unwrap_err();
        assert!(matches!(err, MutationError::NotAMember { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn test_fence_round_trip() {
        let mut state = cluster();
        state.fenced_instances.insert("pg-3".to_string());
        let original = state.fenced_instances.clone();

        let target = FenceTarget::parse("pg-1");
        assert!(state.fence(&target).unwrap());
        assert!(state.unfence(&target).unwrap());
        assert_eq!(state.fenced_instances, original);
    }

    #[test]
    fn test_fence_already_fenced_is_noop() {
        let mut state = cluster();
        let target = FenceTarget::parse("pg-1");
        assert!(state.fence(&target).unwrap());
        assert!(!state.fence(&target).unwrap());
    }

    #[test]
    fn test_fence_all_replaces_set() {
        let mut state = cluster();
        state.fenced_instances.insert("pg-1".to_string());
        assert!(state.fence(&FenceTarget::All).unwrap());
        assert_eq!(
            state.fenced_instances.iter().collect::<Vec<_>>(),
            vec![FENCE_ALL]
        );
        assert!(!state.fence(&FenceTarget::Instance("pg-2".to_string())).unwrap());
    }

    #[test]
    fn test_unfence_all_clears_set() {
        let mut state = cluster();
        state.fence(&FenceTarget::All).unwrap();
        assert!(state.unfence(&FenceTarget::All).unwrap());
        assert!(state.fenced_instances.is_empty());
        assert!(!state.unfence(&FenceTarget::All).unwrap());
    }

    #[test]
    fn test_unfence_single_under_wildcard_fails() {
        let mut state = cluster();
        state.fence(&FenceTarget::All).unwrap();
        let err = state
            .unfence(&FenceTarget::Instance("pg-1".to_string()))
            .unwrap_err();
        assert!(matches!(err, MutationError::SingleInstanceUnfencing { .. }));
        assert!(state.all_fenced());
    }

    #[test]
    fn test_fence_requires_membership() {
        let mut state = cluster();
        let err = state
            .fence(&FenceTarget::Instance("pg-9".to_string()))
            .unwrap_err();
        assert!(matches!(err, MutationError::NotAMember { .. }));
    }

    #[test]
    fn test_unfence_removed_instance_still_fenced() {
        let mut state = cluster();
        state.fenced_instances.insert("pg-9".to_string());
        assert!(state.unfence(&FenceTarget::Instance("pg-9".to_string())).unwrap());
        assert!(state.fenced_instances.is_empty());

        let err = state
            .unfence(&FenceTarget::Instance("pg-9".to_string()))
            .unwrap_err();
        assert!(matches!(err, MutationError::NotAMember { .. }));
    }

    #[test]
    fn test_unfence_not_fenced_member_is_noop() {
        let mut state = cluster();
        assert!(!state.unfence(&FenceTarget::Instance("pg-2".to_string())).unwrap());
    }

    #[test]
    fn test_hibernation_twice_fails() {
        let mut state = cluster();
        state.set_hibernation(HibernationMode::On).unwrap();
        let err = state.set_hibernation(HibernationMode::On).unwrap_err();
        assert!(matches!(err, MutationError::AlreadyInRequestedState { .. }));
        state.set_hibernation(HibernationMode::Off).unwrap();
        assert_eq!(state.hibernation, Some(HibernationMode::Off));
    }

    #[test]
    fn test_hibernation_mode_parse() {
        assert_eq!("on".parse::<HibernationMode>().unwrap(), HibernationMode::On);
        assert_eq!("off".parse::<HibernationMode>().unwrap(), HibernationMode::Off);
        assert!("maybe".parse::<HibernationMode>().is_err());
    }
}
