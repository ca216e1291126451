//! AdmissionReview handling for cache kinds
//!
//! Requests are dispatched by kind through the [`ResourceRegistry`]; kinds it
//! does not know as caches are allowed untouched.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, Operation, SerializePatchError,
};
use kube::core::DynamicObject;
use tkm_common::crd::{CacheKind, CacheResource, ClusterGKMCache, TKMCache, TKMCacheCluster};
use tracing::{debug, error, info};

use crate::mutator::{digest_patch, AdmissionDecision};
use crate::WebhookState;

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The object did not decode as its declared kind
    #[error("object is not a valid {kind}: {source}")]
    Decode {
        /// Declared kind
        kind: CacheKind,
        /// Decode failure
        source: serde_json::Error,
    },

    /// The JSON patch could not be serialized
    #[error(transparent)]
    Patch(#[from] SerializePatchError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::Decode { .. } => StatusCode::BAD_REQUEST,
            WebhookError::Patch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Handle a mutating admission review for any cache kind
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Ok(Json(AdmissionResponse::invalid(e.to_string()).into_review()));
        }
    };

    let response = review(&state, &req).await?;
    Ok(Json(response.into_review()))
}

/// Decide a single admission request
pub async fn review(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, WebhookError> {
    let uid = &request.uid;
    let allow = || AdmissionResponse::from(request);

    if matches!(request.operation, Operation::Delete) {
        return Ok(allow());
    }

    let Some(kind) = state.registry.cache_kind(&request.kind.kind) else {
        debug!(uid = %uid, kind = %request.kind.kind, "Not a cache kind, allowing unchanged");
        return Ok(allow());
    };

    let Some(obj) = &request.object else {
        debug!(uid = %uid, %kind, "No object in request, allowing unchanged");
        return Ok(allow());
    };

    let decision = match kind {
        CacheKind::TKMCache => admit::<TKMCache>(state, obj).await,
        CacheKind::TKMCacheCluster => admit::<TKMCacheCluster>(state, obj).await,
        CacheKind::ClusterGKMCache => admit::<ClusterGKMCache>(state, obj).await,
    };

    let decision = match decision {
        Ok(decision) => decision,
        Err(e) => {
            error!(uid = %uid, %kind, error = %e, "Failed to decode cache object");
            let mut response = AdmissionResponse::invalid(e.to_string());
            response.uid = uid.clone();
            return Ok(response);
        }
    };

    match decision {
        AdmissionDecision::Unchanged => Ok(allow()),
        AdmissionDecision::Patched { digest } => {
            info!(uid = %uid, %kind, %digest, "Patching resolved digest");
            Ok(allow().with_patch(digest_patch(&digest))?)
        }
        AdmissionDecision::Denied { reason, message } => {
            let mut response = allow().deny(message);
            response.result.reason = reason.to_string();
            Ok(response)
        }
    }
}

async fn admit<K: CacheResource>(
    state: &WebhookState,
    obj: &DynamicObject,
) -> Result<AdmissionDecision, WebhookError> {
    let mut cache: K = serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|source| WebhookError::Decode {
            kind: K::KIND,
            source,
        })?;
    Ok(state.mutator.mutate(&mut cache).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::{
        AdmissionConfig, CacheMutator, REASON_DIGEST_RESOLUTION_FAILED,
        REASON_SIGNATURE_VERIFICATION_FAILED,
    };
    use crate::resolver::{MockImageResolver, ResolveError};
    use crate::verifier::{MockSignatureVerifier, Verification};
    use std::time::Duration;
    use tkm_common::ResourceRegistry;

    const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn state(resolver: MockImageResolver, verifier: MockSignatureVerifier) -> WebhookState {
        WebhookState::new(
            Arc::new(ResourceRegistry::new()),
            CacheMutator::new(
                Arc::new(resolver),
                Arc::new(verifier),
                AdmissionConfig {
                    timeout: Duration::from_secs(1),
                },
            ),
        )
    }

    fn signed_state() -> WebhookState {
        let mut resolver = MockImageResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Ok(DIGEST.to_string()));
        let mut verifier = MockSignatureVerifier::new();
        verifier
            .expect_verify()
            .returning(|_| Ok(Verification::from_count(1)));
        state(resolver, verifier)
    }

    fn untouched_state() -> WebhookState {
        let mut resolver = MockImageResolver::new();
        resolver.expect_resolve().never();
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().never();
        state(resolver, verifier)
    }

    fn request(kind: &str, operation: &str, object: serde_json::Value) -> AdmissionRequest<DynamicObject> {
        let review: AdmissionReview<DynamicObject> =
            serde_json::from_value(review_json(kind, operation, object)).unwrap();
        review.try_into().unwrap()
    }

    fn review_json(
        kind: &str,
        operation: &str,
        object: serde_json::Value,
    ) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "tkm.io", "version": "v1alpha1", "kind": kind},
                "resource": {"group": "tkm.io", "version": "v1alpha1", "resource": "caches"},
                "name": "fa",
                "namespace": "default",
                "operation": operation,
                "userInfo": {"username": "alice"},
                "object": object,
                "dryRun": false
            }
        })
    }

    fn cache_object(kind: &str, resolved_digest: Option<&str>) -> serde_json::Value {
        let mut spec = serde_json::json!({
            "name": "flash-attention",
            "image": "quay.io/tkm/fa:latest",
            "kernelProperties": {
                "tritonVersion": "3.1.0",
                "summary": [{"backend": "cuda", "arch": "sm_80", "warp_size": 32}]
            }
        });
        if let Some(d) = resolved_digest {
            spec["resolvedDigest"] = serde_json::Value::String(d.to_string());
        }
        serde_json::json!({
            "apiVersion": "tkm.io/v1alpha1",
            "kind": kind,
            "metadata": {"name": "fa", "namespace": "default"},
            "spec": spec
        })
    }

    fn patch_of(response: &AdmissionResponse) -> serde_json::Value {
        let bytes = response.patch.as_ref().expect("response should carry a patch");
        serde_json::from_slice(bytes).unwrap()
    }

    /// Story: Creating an unpinned cache returns a single-field digest patch
    #[tokio::test]
    async fn story_create_gets_digest_patch() {
        let state = signed_state();
        let req = request("TKMCache", "CREATE", cache_object("TKMCache", None));

        let response = review(&state, &req).await.unwrap();

        assert!(response.allowed);
        assert_eq!(
            patch_of(&response),
            serde_json::json!([{"op": "add", "path": "/spec/resolvedDigest", "value": DIGEST}])
        );
    }

    /// Story: Updating an already pinned cache is allowed without a patch
    #[tokio::test]
    async fn story_update_of_pinned_cache_is_unchanged() {
        let state = untouched_state();
        let req = request(
            "TKMCacheCluster",
            "UPDATE",
            cache_object("TKMCacheCluster", Some(DIGEST)),
        );

        let response = review(&state, &req).await.unwrap();

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn test_denial_carries_reason_and_message() {
        let mut resolver = MockImageResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Ok(DIGEST.to_string()));
        let mut verifier = MockSignatureVerifier::new();
        verifier
            .expect_verify()
            .returning(|_| Ok(Verification::from_count(0)));
        let state = state(resolver, verifier);
        let req = request("ClusterGKMCache", "CREATE", cache_object("ClusterGKMCache", None));

        let response = review(&state, &req).await.unwrap();

        assert!(!response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(response.result.message, "no valid signatures found");
        assert_eq!(response.result.reason, REASON_SIGNATURE_VERIFICATION_FAILED);
    }

    #[tokio::test]
    async fn test_resolution_denial_reason() {
        let mut resolver = MockImageResolver::new();
        resolver.expect_resolve().returning(|_| {
            Err(ResolveError::RegistryUnreachable {
                registry: "quay.io".to_string(),
                message: "connection refused".to_string(),
            })
        });
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().never();
        let state = state(resolver, verifier);
        let req = request("TKMCache", "CREATE", cache_object("TKMCache", None));

        let response = review(&state, &req).await.unwrap();

        assert!(!response.allowed);
        assert_eq!(response.result.reason, REASON_DIGEST_RESOLUTION_FAILED);
        assert!(response
            .result
            .message
            .starts_with("could not resolve image digest: "));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_allowed_untouched() {
        let state = untouched_state();
        let req = request(
            "Deployment",
            "CREATE",
            serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "spec": {}
            }),
        );

        let response = review(&state, &req).await.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn test_node_status_kind_is_not_mutated() {
        let state = untouched_state();
        let req = request(
            "TKMNodeStatus",
            "CREATE",
            serde_json::json!({
                "apiVersion": "tkm.io/v1alpha1",
                "kind": "TKMNodeStatus",
                "metadata": {"name": "node-a"},
                "spec": {"nodeName": "node-a", "caches": []}
            }),
        );

        let response = review(&state, &req).await.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_allowed() {
        let state = untouched_state();
        let req = request("TKMCache", "DELETE", cache_object("TKMCache", None));

        let response = review(&state, &req).await.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn test_object_that_does_not_decode_is_invalid() {
        let state = untouched_state();
        let req = request(
            "TKMCache",
            "CREATE",
            serde_json::json!({
                "apiVersion": "tkm.io/v1alpha1",
                "kind": "TKMCache",
                "metadata": {"name": "fa", "namespace": "default"},
                "spec": {"name": "fa"}
            }),
        );

        let response = review(&state, &req).await.unwrap();
        assert!(!response.allowed);
        assert!(response.result.message.contains("TKMCache"), "{}", response.result.message);
    }

    #[test]
    fn test_webhook_error_status_codes() {
        let source = serde_json::from_str::<TKMCache>("{}").unwrap_err();
        let err = WebhookError::Decode {
            kind: CacheKind::TKMCache,
            source,
        };
        assert!(err.to_string().starts_with("object is not a valid TKMCache"));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
