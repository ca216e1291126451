//! Registry of the resource kinds TKM serves
//!
//! Built once at startup and shared via `Arc<ResourceRegistry>`. The webhook
//! dispatches admission requests through it and the operator installs and
//! prints CRDs from it, so adding a kind means adding one entry here.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use crate::crd::{CacheKind, ClusterGKMCache, TKMCache, TKMCacheCluster, TKMNodeStatus};

/// One registered resource kind
#[derive(Clone, Debug)]
pub struct RegisteredKind {
    /// Kubernetes Kind string
    pub kind: &'static str,
    /// Plural resource name
    pub plural: &'static str,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
    /// Cache kind, when this is one of the digest-pinned cache resources
    pub cache: Option<CacheKind>,
    crd: fn() -> CustomResourceDefinition,
}

impl RegisteredKind {
    /// Generate the CRD manifest for this kind
    pub fn crd(&self) -> CustomResourceDefinition {
        (self.crd)()
    }
}

/// Explicit registry of every kind the operator exposes
#[derive(Clone, Debug)]
pub struct ResourceRegistry {
    kinds: Vec<RegisteredKind>,
}

impl ResourceRegistry {
    /// Build the registry with all TKM kinds
    pub fn new() -> Self {
        Self {
            kinds: vec![
                RegisteredKind {
                    kind: CacheKind::TKMCache.kind_str(),
                    plural: "tkmcaches",
                    namespaced: true,
                    cache: Some(CacheKind::TKMCache),
                    crd: TKMCache::crd,
                },
                RegisteredKind {
                    kind: CacheKind::TKMCacheCluster.kind_str(),
                    plural: "tkmcacheclusters",
                    namespaced: false,
                    cache: Some(CacheKind::TKMCacheCluster),
                    crd: TKMCacheCluster::crd,
                },
                RegisteredKind {
                    kind: CacheKind::ClusterGKMCache.kind_str(),
                    plural: "clustergkmcaches",
                    namespaced: false,
                    cache: Some(CacheKind::ClusterGKMCache),
                    crd: ClusterGKMCache::crd,
                },
                RegisteredKind {
                    kind: "TKMNodeStatus",
                    plural: "tkmnodestatuses",
                    namespaced: false,
                    cache: None,
                    crd: TKMNodeStatus::crd,
                },
            ],
        }
    }

    /// Look up a registered kind by its Kind string
    pub fn get(&self, kind: &str) -> Option<&RegisteredKind> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    /// Resolve a Kind string to a cache kind, if it is one
    pub fn cache_kind(&self, kind: &str) -> Option<CacheKind> {
        self.get(kind).and_then(|k| k.cache)
    }

    /// All registered kinds, in registration order
    pub fn kinds(&self) -> impl Iterator<Item = &RegisteredKind> {
        self.kinds.iter()
    }

    /// CRD manifests for every registered kind
    pub fn crds(&self) -> Vec<CustomResourceDefinition> {
        self.kinds.iter().map(RegisteredKind::crd).collect()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
