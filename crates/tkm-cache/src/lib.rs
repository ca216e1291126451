//! Observed state for TKM kernel caches
//!
//! Admission pins a cache's digest into its spec; this crate reflects that
//! into `status` for every cache kind.

#![deny(missing_docs)]

pub mod controller;

pub use controller::{
    desired_status, error_policy, reconcile, CacheStatusClient, Context, KubeCacheStatusClient,
};
