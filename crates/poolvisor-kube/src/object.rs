// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire shape of the `Cluster` resource and the merge patches sent for it.

use std::collections::{BTreeMap, BTreeSet};

use poolvisor_core::cluster::{ClusterPhase, ClusterState, HibernationMode, ObjectKey, StoreError};
use serde::Deserialize;
use serde_json::{Value, json};

/// Annotation holding the JSON array of fenced instance names.
pub const FENCED_INSTANCES_ANNOTATION: &str = "cnpg.io/fencedInstances";

/// Annotation holding the hibernation mode.
pub const HIBERNATION_ANNOTATION: &str = "cnpg.io/hibernation";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectMeta {
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClusterStatus {
    #[serde(default)]
    pub target_primary: Option<String>,
    #[serde(default)]
    pub target_primary_timestamp: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub phase_reason: Option<String>,
    #[serde(default)]
    pub instance_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClusterObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<ClusterStatus>,
}

impl ClusterObject {
    /// Converts the wire object into a snapshot for `key`.
    pub fn into_state(self, key: ObjectKey) -> Result<ClusterState, StoreError> {
        let mut state = ClusterState::new(key);
        state.resource_version = self.metadata.resource_version;

        let annotations = self.metadata.annotations.unwrap_or_default();
        if let Some(raw) = annotations.get(FENCED_INSTANCES_ANNOTATION) {
            let names: Vec<String> = serde_json::from_str(raw).map_err(|e| {
                StoreError::Invalid(format!(
                    "{} on {}: {}",
                    FENCED_INSTANCES_ANNOTATION, state.key, e
                ))
            })?;
            state.fenced_instances = names.into_iter().collect();
        }
        if let Some(raw) = annotations.get(HIBERNATION_ANNOTATION) {
            let mode = raw.parse::<HibernationMode>().map_err(|e| {
                StoreError::Invalid(format!("{} on {}: {}", HIBERNATION_ANNOTATION, state.key, e))
            })?;
            state.hibernation = Some(mode);
        }

        if let Some(status) = self.status {
            state.target_primary = status.target_primary.unwrap_or_default();
            state.target_primary_timestamp = status.target_primary_timestamp.unwrap_or_default();
            state.phase = status
                .phase
                .filter(|phase| !phase.is_empty())
                .map(|phase| ClusterPhase::from_wire(&phase));
            state.phase_reason = status.phase_reason.unwrap_or_default();
            state.instance_names = status.instance_names.unwrap_or_default().into_iter().collect();
        }

        Ok(state)
    }
}

/// Merge patch for the `/status` subresource.
pub(crate) fn status_patch(state: &ClusterState) -> Value {
    json!({
        "metadata": { "resourceVersion": state.resource_version },
        "status": {
            "targetPrimary": state.target_primary,
            "targetPrimaryTimestamp": state.target_primary_timestamp,
            "phase": state.phase.as_ref().map(|p| p.as_str()),
            "phaseReason": state.phase_reason,
        }
    })
}

/// Merge patch setting (or removing, when empty) the fenced annotation.
pub(crate) fn fenced_instances_patch(state: &ClusterState) -> Value {
    annotation_patch(
        state,
        FENCED_INSTANCES_ANNOTATION,
        encode_fenced(&state.fenced_instances),
    )
}

/// Merge patch setting (or removing) the hibernation annotation.
pub(crate) fn hibernation_patch(state: &ClusterState) -> Value {
    annotation_patch(
        state,
        HIBERNATION_ANNOTATION,
        state.hibernation.map(|mode| mode.as_str().to_string()),
    )
}

fn annotation_patch(state: &ClusterState, name: &str, value: Option<String>) -> Value {
    json!({
        "metadata": {
            "resourceVersion": state.resource_version,
            "annotations": { name: value },
        }
    })
}

/// Sorted JSON array, or `None` for the empty set.
fn encode_fenced(names: &BTreeSet<String>) -> Option<String> {
    if names.is_empty() {
        return None;
    }
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    Some(Value::from(names).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectKey {
        ObjectKey::new("db", "cluster-example")
    }

    #[test]
    fn test_decode_full_object() {
        let object: ClusterObject = serde_json::from_value(json!({
            "apiVersion": "postgresql.cnpg.io/v1",
            "kind": "Cluster",
            "metadata": {
                "name": "cluster-example",
                "namespace": "db",
                "resourceVersion": "812",
                "annotations": {
                    "cnpg.io/fencedInstances": "[\"cluster-example-2\"]",
                    "cnpg.io/hibernation": "off"
                }
            },
            "status": {
                "targetPrimary": "cluster-example-1",
                "phase": "Switchover in progress",
                "phaseReason": "Switching over to cluster-example-1",
                "instanceNames": ["cluster-example-1", "cluster-example-2"]
            }
        }))
        .unwrap();

        let state = object.into_state(key()).unwrap();
        assert_eq!(state.resource_version, "812");
        assert_eq!(state.target_primary, "cluster-example-1");
        assert_eq!(state.phase, Some(ClusterPhase::Switchover));
        assert_eq!(state.instance_names.len(), 2);
        assert!(state.fenced_instances.contains("cluster-example-2"));
        assert_eq!(state.hibernation, Some(HibernationMode::Off));
    }

    #[test]
    fn test_decode_without_status() {
        let object: ClusterObject =
            serde_json::from_value(json!({ "metadata": { "resourceVersion": "1" } })).unwrap();
        let state = object.into_state(key()).unwrap();
        assert!(state.phase.is_none());
        assert!(state.instance_names.is_empty());
        assert!(state.hibernation.is_none());
    }

    #[test]
    fn test_decode_rejects_bad_fenced_annotation() {
        let object: ClusterObject = serde_json::from_value(json!({
            "metadata": {
                "resourceVersion": "1",
                "annotations": { "cnpg.io/fencedInstances": "not json" }
            }
        }))
        .unwrap();
        assert!(matches!(
            object.into_state(key()),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_fenced_patch_is_sorted() {
        let mut state = ClusterState::new(key());
        state.resource_version = "7".to_string();
        state.fenced_instances.insert("b".to_string());
        state.fenced_instances.insert("a".to_string());

        let patch = fenced_instances_patch(&state);
        assert_eq!(patch["metadata"]["resourceVersion"], "7");
        assert_eq!(
            patch["metadata"]["annotations"][FENCED_INSTANCES_ANNOTATION],
            "[\"a\",\"b\"]"
        );
    }

    #[test]
    fn test_empty_fenced_set_removes_annotation() {
        let state = ClusterState::new(key());
        let patch = fenced_instances_patch(&state);
        assert!(patch["metadata"]["annotations"][FENCED_INSTANCES_ANNOTATION].is_null());
    }

    #[test]
    fn test_status_patch() {
        let mut state = ClusterState::new(key()).with_instances(["cluster-example-2"]);
        state.resource_version = "9".to_string();
        assert!(
            state
                .promote("cluster-example-2", "2024-01-01T00:00:00.000000Z")
                .unwrap()
        );

        let patch = status_patch(&state);
        assert_eq!(patch["metadata"]["resourceVersion"], "9");
        assert_eq!(patch["status"]["targetPrimary"], "cluster-example-2");
        assert_eq!(patch["status"]["phase"], "Switchover in progress");
        assert_eq!(
            patch["status"]["phaseReason"],
            "Switching over to cluster-example-2"
        );
    }

    #[test]
    fn test_hibernation_patch() {
        let mut state = ClusterState::new(key());
        state.hibernation = Some(HibernationMode::On);
        let patch = hibernation_patch(&state);
        assert_eq!(patch["metadata"]["annotations"][HIBERNATION_ANNOTATION], "on");
    }
}
