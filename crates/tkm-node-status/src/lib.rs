//! Node accelerator compatibility for TKM
//!
//! Decides, per node, whether the GPU present can run every kernel cache the
//! node has been assigned, and publishes the answer on its `TKMNodeStatus`.

#![deny(missing_docs)]

pub mod controller;
pub mod probe;

pub use controller::{error_policy, reconcile, Context, KubeNodeStatusClient, NodeStatusClient};
pub use probe::{GpuInfo, HardwareProbe, ProbeError, StaticProbe};
