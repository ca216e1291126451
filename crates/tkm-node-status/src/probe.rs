//! Accelerator detection
//!
//! The reconciler never talks to GPU runtimes itself; it asks a
//! [`HardwareProbe`]. Production nodes plug in a probe that queries the local
//! driver, while [`StaticProbe`] reports a configured pair.

use async_trait::async_trait;
use thiserror::Error;
use tkm_common::crd::CacheRequirement;

#[cfg(test)]
use mockall::automock;

/// Default accelerator reported by [`StaticProbe`]
pub const DEFAULT_GPU_TYPE: &str = "nvidia";

/// Default driver version reported by [`StaticProbe`]
pub const DEFAULT_DRIVER_VERSION: &str = "470.57.02";

/// Accelerator detected on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuInfo {
    /// Vendor/type, e.g. `nvidia` or `amd`
    pub gpu_type: String,
    /// Driver version string
    pub driver_version: String,
}

impl GpuInfo {
    /// Create from a type and driver version
    pub fn new(gpu_type: impl Into<String>, driver_version: impl Into<String>) -> Self {
        Self {
            gpu_type: gpu_type.into(),
            driver_version: driver_version.into(),
        }
    }

    /// Exact match on both type and driver version
    pub fn satisfies(&self, requirement: &CacheRequirement) -> bool {
        self.gpu_type == requirement.gpu_type && self.driver_version == requirement.driver_version
    }
}

/// Why detection failed
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The accelerator runtime could not be queried
    #[error("GPU detection failed: {0}")]
    Unavailable(String),

    /// Detection did not finish in time
    #[error("GPU detection timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Detects the accelerator present on the node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    /// Query the accelerator type and driver version
    async fn probe(&self) -> Result<GpuInfo, ProbeError>;
}

/// Probe that always reports the same accelerator
#[derive(Clone, Debug)]
pub struct StaticProbe {
    info: GpuInfo,
}

impl StaticProbe {
    /// Report the given accelerator
    pub fn new(info: GpuInfo) -> Self {
        Self { info }
    }
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new(GpuInfo::new(DEFAULT_GPU_TYPE, DEFAULT_DRIVER_VERSION))
    }
}

#[async_trait]
impl HardwareProbe for StaticProbe {
    async fn probe(&self) -> Result<GpuInfo, ProbeError> {
        Ok(self.info.clone())
    }
}
