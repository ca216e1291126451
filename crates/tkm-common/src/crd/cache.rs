//! Kernel cache CRD types
//!
//! Three kinds describe a GPU-kernel cache image: the namespaced `TKMCache`,
//! the cluster-scoped `TKMCacheCluster`, and its alias `ClusterGKMCache`.
//! They share one spec and one status shape; only scope differs. Code that
//! does not care which kind it holds works through [`CacheResource`].
//!
//! `spec.resolvedDigest` is written by the admission webhook and nothing else.
//! Once it is non-empty it stays put, so a tag that later moves does not
//! change which bytes the cache points at.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::Condition;

// =============================================================================
// Shared spec and status
// =============================================================================

/// Desired state shared by every cache kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    /// Human-readable cache name
    pub name: String,

    /// Image reference (registry/repo[:tag|@digest])
    pub image: String,

    /// Immutable content digest, injected by the admission webhook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_digest: Option<String>,

    /// Properties of the compiled kernels in the image
    #[serde(default)]
    pub kernel_properties: KernelProperties,
}

/// Properties describing the compiled kernels in a cache image
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KernelProperties {
    /// Compiler/runtime version that produced the kernels
    #[serde(default)]
    pub triton_version: String,

    /// Optional variant label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Number of kernels in the cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<u32>,

    /// Per-target summary of the compiled kernels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary: Vec<KernelSummary>,
}

/// One compilation target present in a cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KernelSummary {
    /// Backend (e.g., cuda, hip)
    pub backend: String,

    /// Architecture (e.g., sm_80, gfx90a)
    pub arch: String,

    /// Warp/wavefront lane width
    #[serde(rename = "warp_size")]
    pub warp_size: u32,
}

/// Observed state shared by every cache kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Status conditions, unique by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the status was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,

    /// Copy of the kernel summary from the spec
    ///
    /// Always serialized, so a merge patch can clear it.
    #[serde(default)]
    pub summary: Vec<KernelSummary>,

    /// Mirror of `spec.resolvedDigest`
    ///
    /// Serialized as `null` when unset, which a merge patch reads as removal.
    #[serde(default)]
    pub digest: Option<String>,
}

// =============================================================================
// The three cache kinds
// =============================================================================

/// Namespaced kernel cache
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tkm.io",
    version = "v1alpha1",
    kind = "TKMCache",
    plural = "tkmcaches",
    shortname = "tkmc",
    namespaced,
    status = "CacheStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Digest","type":"string","jsonPath":".spec.resolvedDigest"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct TKMCacheSpec {
    /// Cache definition
    #[serde(flatten)]
    pub cache: CacheSpec,
}

/// Cluster-scoped kernel cache
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tkm.io",
    version = "v1alpha1",
    kind = "TKMCacheCluster",
    plural = "tkmcacheclusters",
    status = "CacheStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Digest","type":"string","jsonPath":".spec.resolvedDigest"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct TKMCacheClusterSpec {
    /// Cache definition
    #[serde(flatten)]
    pub cache: CacheSpec,
}

/// Cluster-scoped kernel cache (alias kind)
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tkm.io",
    version = "v1alpha1",
    kind = "ClusterGKMCache",
    plural = "clustergkmcaches",
    status = "CacheStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Digest","type":"string","jsonPath":".spec.resolvedDigest"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ClusterGKMCacheSpec {
    /// Cache definition
    #[serde(flatten)]
    pub cache: CacheSpec,
}

/// Which cache kind an object is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Namespaced `TKMCache`
    TKMCache,
    /// Cluster-scoped `TKMCacheCluster`
    TKMCacheCluster,
    /// Cluster-scoped `ClusterGKMCache`
    ClusterGKMCache,
}

impl CacheKind {
    /// Kubernetes Kind string
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::TKMCache => "TKMCache",
            Self::TKMCacheCluster => "TKMCacheCluster",
            Self::ClusterGKMCache => "ClusterGKMCache",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_str())
    }
}

// =============================================================================
// Kind-independent access
// =============================================================================

/// Capability shared by every cache kind
///
/// The admission mutator and the cache status reconciler are written once
/// against this trait; the per-kind impls only say where the spec and status
/// live.
pub trait CacheResource:
    kube::Resource<DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Which kind this is
    const KIND: CacheKind;

    /// Shared spec
    fn cache_spec(&self) -> &CacheSpec;

    /// Shared spec, mutably
    fn cache_spec_mut(&mut self) -> &mut CacheSpec;

    /// Observed state, if any has been written
    fn cache_status(&self) -> Option<&CacheStatus>;

    /// Image reference as submitted
    fn image(&self) -> &str {
        &self.cache_spec().image
    }

    /// Pinned digest, treating an empty string as unset
    fn resolved_digest(&self) -> Option<&str> {
        self.cache_spec()
            .resolved_digest
            .as_deref()
            .filter(|d| !d.is_empty())
    }

    /// Pin the content digest
    fn set_resolved_digest(&mut self, digest: impl Into<String>) {
        self.cache_spec_mut().resolved_digest = Some(digest.into());
    }
}

impl CacheResource for TKMCache {
    const KIND: CacheKind = CacheKind::TKMCache;

    fn cache_spec(&self) -> &CacheSpec {
        &self.spec.cache
    }

    fn cache_spec_mut(&mut self) -> &mut CacheSpec {
        &mut self.spec.cache
    }

    fn cache_status(&self) -> Option<&CacheStatus> {
        self.status.as_ref()
    }
}

impl CacheResource for TKMCacheCluster {
    const KIND: CacheKind = CacheKind::TKMCacheCluster;

    fn cache_spec(&self) -> &CacheSpec {
        &self.spec.cache
    }

    fn cache_spec_mut(&mut self) -> &mut CacheSpec {
        &mut self.spec.cache
    }

    fn cache_status(&self) -> Option<&CacheStatus> {
        self.status.as_ref()
    }
}

impl CacheResource for ClusterGKMCache {
    const KIND: CacheKind = CacheKind::ClusterGKMCache;

    fn cache_spec(&self) -> &CacheSpec {
        &self.spec.cache
    }

    fn cache_spec_mut(&mut self) -> &mut CacheSpec {
        &mut self.spec.cache
    }

    fn cache_status(&self) -> Option<&CacheStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::{CustomResourceExt, Resource};

    fn sample_spec() -> CacheSpec {
        CacheSpec {
            name: "flash-attention".to_string(),
            image: "quay.io/tkm/flash-attention:latest".to_string(),
            resolved_digest: None,
            kernel_properties: KernelProperties {
                triton_version: "3.1.0".to_string(),
                variant: None,
                entry_count: Some(12),
                summary: vec![KernelSummary {
                    backend: "cuda".to_string(),
                    arch: "sm_80".to_string(),
                    warp_size: 32,
                }],
            },
        }
    }

    /// Story: The flattened spec keeps the original field names on the wire
    #[test]
    fn story_spec_wire_format() {
        let cache = TKMCache::new(
            "fa",
            TKMCacheSpec {
                cache: sample_spec(),
            },
        );
        let json = serde_json::to_value(&cache).unwrap();

        assert_eq!(json["spec"]["image"], "quay.io/tkm/flash-attention:latest");
        assert_eq!(json["spec"]["kernelProperties"]["tritonVersion"], "3.1.0");
        assert_eq!(json["spec"]["kernelProperties"]["entryCount"], 12);
        assert_eq!(
            json["spec"]["kernelProperties"]["summary"][0]["warp_size"],
            32
        );
        assert!(json["spec"].get("cache").is_none());
        assert!(json["spec"].get("resolvedDigest").is_none());
    }

    #[test]
    fn test_spec_parses_from_yaml() {
        let yaml = r#"
apiVersion: tkm.io/v1alpha1
kind: TKMCacheCluster
metadata:
  name: shared
spec:
  name: shared
  image: registry.example.com/kernels/shared:v2
  resolvedDigest: sha256:abc
"#;
        let cache: TKMCacheCluster = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cache.image(), "registry.example.com/kernels/shared:v2");
        assert_eq!(cache.resolved_digest(), Some("sha256:abc"));
        assert_eq!(cache.cache_spec().kernel_properties, KernelProperties::default());
    }

    #[test]
    fn test_empty_resolved_digest_reads_as_unset() {
        let mut spec = sample_spec();
        spec.resolved_digest = Some(String::new());
        let cache = ClusterGKMCache::new("alias", ClusterGKMCacheSpec { cache: spec });
        assert_eq!(cache.resolved_digest(), None);
    }

    #[test]
    fn test_set_resolved_digest_through_trait() {
        let mut cache = TKMCache::new(
            "fa",
            TKMCacheSpec {
                cache: sample_spec(),
            },
        );
        cache.set_resolved_digest("sha256:aaa");
        assert_eq!(cache.resolved_digest(), Some("sha256:aaa"));
        assert_eq!(cache.spec.cache.resolved_digest.as_deref(), Some("sha256:aaa"));
    }

    #[test]
    fn test_kind_constants_match_kube_kind() {
        assert_eq!(TKMCache::KIND.kind_str(), TKMCache::kind(&()));
        assert_eq!(TKMCacheCluster::KIND.kind_str(), TKMCacheCluster::kind(&()));
        assert_eq!(ClusterGKMCache::KIND.kind_str(), ClusterGKMCache::kind(&()));
    }

    #[test]
    fn test_scopes() {
        assert_eq!(TKMCache::crd().spec.scope, "Namespaced");
        assert_eq!(TKMCacheCluster::crd().spec.scope, "Cluster");
        assert_eq!(ClusterGKMCache::crd().spec.scope, "Cluster");
    }
}
