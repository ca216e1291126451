//! Mutating admission webhook for TKM kernel caches
//!
//! Every cache kind is pinned to an immutable, signature-verified image
//! digest on admission:
//!
//! - [`reference`] parses and normalizes image references
//! - [`resolver`] turns a reference into a manifest digest via the registry API
//! - [`verifier`] checks keyless cosign signatures through Sigstore
//! - [`mutator`] runs the pin-and-verify algorithm over any cache kind
//! - [`admission`] adapts it to Kubernetes `AdmissionReview`

#![deny(missing_docs)]

pub mod admission;
pub mod mutator;
pub mod reference;
pub mod resolver;
pub mod verifier;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tkm_common::ResourceRegistry;

pub use admission::WebhookError;
pub use mutator::{AdmissionConfig, AdmissionDecision, CacheMutator};
pub use reference::{parse_reference, pin_to_digest, ReferenceError};
pub use resolver::{ImageResolver, RegistryConfig, RegistryResolver, ResolveError};
pub use verifier::{CosignVerifier, SignatureVerifier, SignerIdentity, Verification, VerifyError};

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Kinds the webhook knows how to dispatch
    pub registry: Arc<ResourceRegistry>,
    /// Pin-and-verify algorithm
    pub mutator: CacheMutator,
}

impl WebhookState {
    /// Create webhook state from the registry and mutator
    pub fn new(registry: Arc<ResourceRegistry>, mutator: CacheMutator) -> Self {
        Self { registry, mutator }
    }
}

/// Create the webhook router with all mutation endpoints
///
/// - POST /mutate-tkmcache
/// - POST /mutate-tkmcachecluster
/// - POST /mutate-clustergkmcache
/// - GET /healthz
///
/// The three mutation paths share one handler; the request's kind decides
/// what happens.
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate-tkmcache", post(admission::mutate_handler))
        .route("/mutate-tkmcachecluster", post(admission::mutate_handler))
        .route("/mutate-clustergkmcache", post(admission::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
