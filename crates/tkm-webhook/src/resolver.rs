//! Image reference to content digest resolution
//!
//! A `HEAD` on the manifest is enough to learn its digest, so no layer
//! content is ever pulled. Token exchange and the distribution API itself
//! are handled by `oci_client`.

use std::time::Duration;

use async_trait::async_trait;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::errors::{OciDistributionError, OciErrorCode};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::reference::{parse_reference, ReferenceError};

/// Default deadline for one resolution, token exchange included
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from resolving an image reference
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The reference could not be parsed
    #[error("invalid image reference: {0}")]
    InvalidReference(#[from] ReferenceError),

    /// The registry could not be reached or answered with a server error
    #[error("registry {registry} unreachable: {message}")]
    RegistryUnreachable {
        /// Registry host
        registry: String,
        /// What went wrong
        message: String,
    },

    /// The registry has no manifest for the reference
    #[error("manifest not found for {reference}")]
    ManifestNotFound {
        /// Fully qualified reference that was looked up
        reference: String,
    },

    /// The deadline elapsed before the registry answered
    #[error("registry request timed out after {0:?}")]
    Timeout(Duration),
}

impl ResolveError {
    fn from_registry(reference: &Reference, err: OciDistributionError) -> Self {
        if is_not_found(&err) {
            return Self::ManifestNotFound {
                reference: reference.whole(),
            };
        }
        Self::RegistryUnreachable {
            registry: reference.registry().to_string(),
            message: err.to_string(),
        }
    }
}

fn is_not_found(err: &OciDistributionError) -> bool {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope
            .errors
            .iter()
            .any(|e| matches!(e.code, OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown)),
        _ => false,
    }
}

/// Resolves a mutable image reference to an immutable content digest
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// Return the manifest digest (`sha256:...`) the reference points at right now
    async fn resolve(&self, image: &str) -> Result<String, ResolveError>;
}

/// Registry client settings
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Deadline for one resolution
    pub timeout: Duration,
    /// Registries reached over plain HTTP (host or host:port)
    pub insecure_registries: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REGISTRY_TIMEOUT,
            insecure_registries: Vec::new(),
        }
    }
}

/// [`ImageResolver`] backed by the OCI distribution API
#[derive(Clone)]
pub struct RegistryResolver {
    client: Client,
    config: RegistryConfig,
}

impl RegistryResolver {
    /// Create a resolver with its own registry client
    pub fn new(config: RegistryConfig) -> Self {
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::HttpsExcept(config.insecure_registries.clone()),
            ..Default::default()
        });
        Self { client, config }
    }
}

#[async_trait]
impl ImageResolver for RegistryResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, image: &str) -> Result<String, ResolveError> {
        let reference = parse_reference(image)?;
        let lookup = self
            .client
            .fetch_manifest_digest(&reference, &RegistryAuth::Anonymous);

        match tokio::time::timeout(self.config.timeout, lookup).await {
            Ok(Ok(fetched)) => {
                // A pinned reference keeps its own digest once the registry confirms it exists
                let digest = reference.digest().map(str::to_string).unwrap_or(fetched);
                debug!(image = %reference, %digest, "resolved image digest");
                Ok(digest)
            }
            Ok(Err(e)) => {
                let err = ResolveError::from_registry(&reference, e);
                warn!(image = %reference, error = %err, "failed to resolve image digest");
                Err(err)
            }
            Err(_) => Err(ResolveError::Timeout(self.config.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    /// Bind a throwaway registry on loopback and return its `host:port`
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn resolver_for(addr: &str) -> RegistryResolver {
        RegistryResolver::new(RegistryConfig {
            timeout: Duration::from_secs(5),
            insecure_registries: vec![addr.to_string()],
        })
    }

    fn manifest_route(router: axum::routing::MethodRouter) -> Router {
        Router::new().route("/v2/tkm/cache/manifests/{reference}", router)
    }

    fn with_digest(digest: &'static str) -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert("Docker-Content-Digest", HeaderValue::from_static(digest));
        (StatusCode::OK, headers)
    }

    /// Story: A tag resolves to the digest the registry reports on HEAD
    #[tokio::test]
    async fn story_head_reports_digest() {
        let addr = serve(manifest_route(
            get(|| async { StatusCode::METHOD_NOT_ALLOWED }).head(|| async { with_digest(DIGEST) }),
        ))
        .await;

        let digest = resolver_for(&addr)
            .resolve(&format!("{addr}/tkm/cache:v1"))
            .await
            .unwrap();
        assert_eq!(digest, DIGEST);
    }

    #[tokio::test]
    async fn test_not_found_maps_to_manifest_not_found() {
        let addr = serve(manifest_route(get(|| async { StatusCode::NOT_FOUND }))).await;

        let err = resolver_for(&addr)
            .resolve(&format!("{addr}/tkm/cache:gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestNotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_manifest_unknown_envelope_maps_to_manifest_not_found() {
        let addr = serve(manifest_route(get(|| async {
            (
                StatusCode::NOT_FOUND,
                axum::Json(serde_json::json!({
                    "errors": [{"code": "MANIFEST_UNKNOWN", "message": "manifest unknown"}]
                })),
            )
        })))
        .await;

        let err = resolver_for(&addr)
            .resolve(&format!("{addr}/tkm/cache:gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestNotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_server_error_maps_to_unreachable() {
        let addr = serve(manifest_route(get(|| async { StatusCode::SERVICE_UNAVAILABLE }))).await;

        let err = resolver_for(&addr)
            .resolve(&format!("{addr}/tkm/cache:v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::RegistryUnreachable { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_pinned_reference_resolves_to_itself() {
        let addr = serve(manifest_route(
            get(|| async { StatusCode::OK }).head(|| async { with_digest(DIGEST) }),
        ))
        .await;

        let digest = resolver_for(&addr)
            .resolve(&format!("{addr}/tkm/cache@{DIGEST}"))
            .await
            .unwrap();
        assert_eq!(digest, DIGEST);
    }

    #[tokio::test]
    async fn test_invalid_reference_fails_before_network() {
        let resolver = RegistryResolver::new(RegistryConfig::default());
        let err = resolver.resolve("Not A Reference").await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidReference(_)));

        let err = resolver.resolve("").await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::InvalidReference(ReferenceError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = resolver_for(&addr)
            .resolve(&format!("{addr}/tkm/cache:v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::RegistryUnreachable { .. }), "{err:?}");
    }
}
