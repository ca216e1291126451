//! TKMNodeStatus CRD types
//!
//! One `TKMNodeStatus` exists per node, created by the node agent. The spec
//! lists the caches the node must serve and the accelerator each one needs;
//! the status records what the reconciler actually detected and whether the
//! node is compatible and ready.
//!
//! Requirements and observations live in separate fields. A successful check
//! appends to `status.observed` and never rewrites `spec.caches`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Per-node list of caches and their accelerator requirements
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tkm.io",
    version = "v1alpha1",
    kind = "TKMNodeStatus",
    plural = "tkmnodestatuses",
    shortname = "tkmns",
    status = "TKMNodeStatusStatus",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TKMNodeStatusSpec {
    /// Node this status belongs to
    #[serde(default)]
    pub node_name: String,

    /// Caches assigned to the node, checked in order
    #[serde(default)]
    pub caches: Vec<CacheRequirement>,
}

/// Accelerator requirement for one cache on a node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheRequirement {
    /// Cache name
    pub name: String,

    /// Required accelerator vendor/type (e.g., nvidia, amd)
    pub gpu_type: String,

    /// Required driver version
    pub driver_version: String,
}

/// Observed state of a node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TKMNodeStatusStatus {
    /// Status conditions, unique by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last detected accelerator per cache that passed its check
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed: Vec<CacheObservation>,

    /// When the status was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,

    /// Spec generation the conditions describe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Accelerator detected while checking one cache
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheObservation {
    /// Cache name
    pub name: String,

    /// Detected accelerator vendor/type
    pub gpu_type: String,

    /// Detected driver version
    pub driver_version: String,

    /// When the detection happened
    pub checked_at: DateTime<Utc>,
}

impl TKMNodeStatusStatus {
    /// Record a detection for a cache, replacing an earlier one in place.
    ///
    /// Returns whether the detected values differ from what was recorded.
    /// `checked_at` only moves when the values do.
    pub fn record_observation(
        &mut self,
        name: &str,
        gpu_type: &str,
        driver_version: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.observed.iter_mut().find(|o| o.name == name) {
            Some(existing) => {
                if existing.gpu_type == gpu_type && existing.driver_version == driver_version {
                    return false;
                }
                existing.gpu_type = gpu_type.to_string();
                existing.driver_version = driver_version.to_string();
                existing.checked_at = now;
                true
            }
            None => {
                self.observed.push(CacheObservation {
                    name: name.to_string(),
                    gpu_type: gpu_type.to_string(),
                    driver_version: driver_version.to_string(),
                    checked_at: now,
                });
                true
            }
        }
    }

    /// Find the observation recorded for a cache
    pub fn observation(&self, name: &str) -> Option<&CacheObservation> {
        self.observed.iter().find(|o| o.name == name)
    }

    /// Drop observations for caches no longer required
    ///
    /// Returns whether anything was removed.
    pub fn retain_required(&mut self, required: &[CacheRequirement]) -> bool {
        let before = self.observed.len();
        self.observed
            .retain(|o| required.iter().any(|r| r.name == o.name));
        self.observed.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kube::CustomResourceExt;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_node_status_is_cluster_scoped() {
        assert_eq!(TKMNodeStatus::crd().spec.scope, "Cluster");
    }

    #[test]
    fn test_spec_wire_format() {
        let ns = TKMNodeStatus::new(
            "gpu-node-1",
            TKMNodeStatusSpec {
                node_name: "gpu-node-1".to_string(),
                caches: vec![CacheRequirement {
                    name: "flash-attention".to_string(),
                    gpu_type: "nvidia".to_string(),
                    driver_version: "470.57.02".to_string(),
                }],
            },
        );
        let json = serde_json::to_value(&ns).unwrap();
        assert_eq!(json["spec"]["nodeName"], "gpu-node-1");
        assert_eq!(json["spec"]["caches"][0]["gpuType"], "nvidia");
        assert_eq!(json["spec"]["caches"][0]["driverVersion"], "470.57.02");
    }

    /// Story: Repeated identical detections leave the observation untouched
    #[test]
    fn story_observation_is_stable_across_rechecks() {
        let mut status = TKMNodeStatusStatus::default();

        assert!(status.record_observation("fa", "nvidia", "470.57.02", at(10)));
        assert!(!status.record_observation("fa", "nvidia", "470.57.02", at(20)));

        let obs = status.observation("fa").unwrap();
        assert_eq!(obs.checked_at, at(10));
        assert_eq!(status.observed.len(), 1);
    }

    #[test]
    fn test_retain_required_drops_removed_caches() {
        let mut status = TKMNodeStatusStatus::default();
        status.record_observation("a", "nvidia", "470", at(1));
        status.record_observation("b", "nvidia", "470", at(1));
        let required = [CacheRequirement {
            name: "b".to_string(),
            gpu_type: "nvidia".to_string(),
            driver_version: "470".to_string(),
        }];

        assert!(status.retain_required(&required));
        assert!(status.observation("a").is_none());
        assert!(status.observation("b").is_some());
        assert!(!status.retain_required(&required));
    }

    #[test]
    fn test_observation_updates_in_place() {
        let mut status = TKMNodeStatusStatus::default();
        status.record_observation("a", "nvidia", "470", at(1));
        status.record_observation("b", "nvidia", "470", at(1));

        assert!(status.record_observation("a", "nvidia", "535", at(2)));

        assert_eq!(status.observed[0].name, "a");
        assert_eq!(status.observed[0].driver_version, "535");
        assert_eq!(status.observed[0].checked_at, at(2));
        assert_eq!(status.observed[1].name, "b");
    }
}
