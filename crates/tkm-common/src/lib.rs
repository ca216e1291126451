//! Common types for TKM: CRDs, conditions, errors, and utilities
//!
//! Every other TKM crate builds on these definitions:
//! - [`crd`] - Cache kinds and the per-node `TKMNodeStatus` resource
//! - [`conditions`] - Ordered upsert over Kubernetes-style status conditions
//! - [`registry`] - Explicit registry of the resource kinds TKM serves
//! - [`telemetry`] - Structured logging and optional OTLP trace export

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod registry;
pub mod telemetry;

pub use error::Error;
pub use registry::{RegisteredKind, ResourceRegistry};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for every TKM custom resource
pub const TKM_GROUP: &str = "tkm.io";

/// API version for every TKM custom resource
pub const TKM_VERSION: &str = "v1alpha1";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "tkm-operator";
