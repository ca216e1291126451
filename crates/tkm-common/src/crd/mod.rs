//! Custom Resource Definitions for TKM
//!
//! This module contains all CRD definitions served by the TKM operator.

mod cache;
mod node_status;
mod types;

pub use cache::{
    CacheKind, CacheResource, CacheSpec, CacheStatus, ClusterGKMCache, ClusterGKMCacheSpec,
    KernelProperties, KernelSummary, TKMCache, TKMCacheCluster, TKMCacheClusterSpec,
    TKMCacheSpec,
};
pub use node_status::{
    CacheObservation, CacheRequirement, TKMNodeStatus, TKMNodeStatusSpec, TKMNodeStatusStatus,
};
pub use types::{
    Condition, ConditionStatus, CONDITION_COMPATIBLE, CONDITION_READY, CONDITION_VERIFIED,
    REASON_AWAITING_ADMISSION, REASON_CACHE_READY, REASON_DIGEST_PINNED,
    REASON_GPU_COMPATIBLE, REASON_GPU_DETECT_ERROR, REASON_INCOMPATIBLE_GPU,
};
