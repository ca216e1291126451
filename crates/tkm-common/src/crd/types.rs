//! Status condition shape and the condition vocabulary TKM publishes

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tri-state value of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Holds
    True,
    /// Does not hold
    False,
    /// Not yet evaluated
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        })
    }
}

/// One entry of a `status.conditions` list
///
/// External schedulers read these as `{type, status, reason, message,
/// lastTransitionTime}`; use [`crate::conditions`] to modify a list.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// `Ready`, `Compatible`, or `Verified`
    #[serde(rename = "type")]
    pub type_: String,
    /// Current value
    pub status: ConditionStatus,
    /// CamelCase cause, one of the `REASON_*` constants
    pub reason: String,
    /// Human-readable detail
    pub message: String,
    /// When `status` last changed value
    pub last_transition_time: DateTime<Utc>,
}

/// Aggregate readiness of a node or cache
pub const CONDITION_READY: &str = "Ready";

/// Whether a node's accelerator matches every assigned cache
pub const CONDITION_COMPATIBLE: &str = "Compatible";

/// Whether a cache's image digest has been pinned by admission
pub const CONDITION_VERIFIED: &str = "Verified";

/// All caches on the node passed the compatibility check
pub const REASON_CACHE_READY: &str = "CacheReady";

/// The detected accelerator matched every requirement
pub const REASON_GPU_COMPATIBLE: &str = "GPUCompatible";

/// The hardware probe itself failed
pub const REASON_GPU_DETECT_ERROR: &str = "GPUDetectError";

/// The detected accelerator does not satisfy a requirement
pub const REASON_INCOMPATIBLE_GPU: &str = "IncompatibleGPU";

/// The cache spec carries an admission-pinned digest
pub const REASON_DIGEST_PINNED: &str = "DigestPinned";

/// The cache has not been through the admission gate yet
pub const REASON_AWAITING_ADMISSION: &str = "AwaitingAdmission";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Story: Conditions serialize in the canonical Kubernetes shape
    #[test]
    fn story_condition_wire_shape() {
        let condition = Condition {
            type_: CONDITION_READY.to_string(),
            status: ConditionStatus::True,
            reason: REASON_CACHE_READY.to_string(),
            message: "all caches are ready".to_string(),
            last_transition_time: Utc.timestamp_opt(0, 0).single().unwrap(),
        };
        let json = serde_json::to_value(&condition).unwrap();

        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert_eq!(json["reason"], "CacheReady");
        assert_eq!(json["lastTransitionTime"], "1970-01-01T00:00:00Z");
        assert!(json.get("type_").is_none());
    }

    #[test]
    fn test_condition_status_default_is_unknown() {
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }

    #[test]
    fn test_status_display_matches_wire_form() {
        for status in [
            ConditionStatus::True,
            ConditionStatus::False,
            ConditionStatus::Unknown,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
