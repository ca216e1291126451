//! Digest pinning for kernel cache admission
//!
//! One algorithm serves every cache kind through [`CacheResource`]:
//!
//! 1. A cache that already carries `spec.resolvedDigest` is admitted untouched.
//! 2. Otherwise the image is resolved to a digest; failure denies.
//! 3. The digest-pinned image must carry at least one trusted signature;
//!    an error or zero signatures denies.
//! 4. The digest is written into the object and returned for patching.
//!
//! Resolution and verification share one admission deadline, and running out
//! of time is treated like any other failure.

use std::sync::Arc;
use std::time::Duration;

use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::PointerBuf;
use kube::ResourceExt;
use tkm_common::crd::CacheResource;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::reference::{parse_reference, pin_to_digest};
use crate::resolver::{ImageResolver, ResolveError};
use crate::verifier::{SignatureVerifier, Verification, VerifyError};

/// Default admission budget, under the API server's 10s webhook default
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(8);

/// Admission status reason when the digest could not be resolved
pub const REASON_DIGEST_RESOLUTION_FAILED: &str = "DigestResolutionFailed";

/// Admission status reason when signatures are missing or invalid
pub const REASON_SIGNATURE_VERIFICATION_FAILED: &str = "SignatureVerificationFailed";

/// Admission-path settings
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Budget for one admission call, resolution and verification together
    ///
    /// Keep it below the webhook's `timeoutSeconds`, or the API server gives
    /// up first and applies its failure policy instead of our denial.
    pub timeout: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ADMISSION_TIMEOUT,
        }
    }
}

/// What admission should do with a cache object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Allow without a patch
    Unchanged,
    /// Allow with `spec.resolvedDigest` set to `digest`
    Patched {
        /// The pinned digest
        digest: String,
    },
    /// Reject the write
    Denied {
        /// Machine-readable reason
        reason: &'static str,
        /// Human-readable message
        message: String,
    },
}

impl AdmissionDecision {
    fn denied(reason: &'static str, message: impl Into<String>) -> Self {
        Self::Denied {
            reason,
            message: message.into(),
        }
    }
}

/// Pins and verifies cache images at admission time
#[derive(Clone)]
pub struct CacheMutator {
    resolver: Arc<dyn ImageResolver>,
    verifier: Arc<dyn SignatureVerifier>,
    config: AdmissionConfig,
}

impl CacheMutator {
    /// Create a mutator from its collaborators
    pub fn new(
        resolver: Arc<dyn ImageResolver>,
        verifier: Arc<dyn SignatureVerifier>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            resolver,
            verifier,
            config,
        }
    }

    /// Decide admission for a cache object of any kind
    ///
    /// On [`AdmissionDecision::Patched`] the digest has also been written into
    /// `cache`.
    pub async fn mutate<K: CacheResource>(&self, cache: &mut K) -> AdmissionDecision {
        let name = cache.name_any();
        let kind = K::KIND;

        if let Some(digest) = cache.resolved_digest() {
            debug!(%kind, %name, digest, "cache already pinned, admitting unchanged");
            return AdmissionDecision::Unchanged;
        }

        let image = cache.image().to_string();
        let deadline = Instant::now() + self.config.timeout;

        let digest = match self.resolve(&image, deadline).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!(%kind, %name, %image, error = %e, "denying cache: digest resolution failed");
                return AdmissionDecision::denied(
                    REASON_DIGEST_RESOLUTION_FAILED,
                    format!("could not resolve image digest: {e}"),
                );
            }
        };

        let pinned = match pinned_reference(&image, &digest) {
            Ok(pinned) => pinned,
            Err(e) => {
                return AdmissionDecision::denied(
                    REASON_DIGEST_RESOLUTION_FAILED,
                    format!("could not resolve image digest: {e}"),
                );
            }
        };

        match self.verify(&pinned, deadline).await {
            Ok(verification) if verification.verified => {
                info!(
                    %kind,
                    %name,
                    %image,
                    %digest,
                    signatures = verification.signature_count,
                    "pinning verified cache image"
                );
            }
            Ok(_) => {
                warn!(%kind, %name, %image, %digest, "denying cache: no valid signatures");
                return AdmissionDecision::denied(
                    REASON_SIGNATURE_VERIFICATION_FAILED,
                    "no valid signatures found",
                );
            }
            Err(e) => {
                warn!(%kind, %name, %image, error = %e, "denying cache: signature verification failed");
                return AdmissionDecision::denied(
                    REASON_SIGNATURE_VERIFICATION_FAILED,
                    format!("signature verification failed: {e}"),
                );
            }
        }

        cache.set_resolved_digest(digest.clone());
        AdmissionDecision::Patched { digest }
    }

    async fn resolve(&self, image: &str, deadline: Instant) -> Result<String, ResolveError> {
        timeout_at(deadline, self.resolver.resolve(image))
            .await
            .unwrap_or(Err(ResolveError::Timeout(self.config.timeout)))
    }

    async fn verify(&self, image: &str, deadline: Instant) -> Result<Verification, VerifyError> {
        timeout_at(deadline, self.verifier.verify(image))
            .await
            .unwrap_or(Err(VerifyError::Timeout(self.config.timeout)))
    }
}

/// The image reference re-addressed by digest, so verification covers the
/// exact bytes being pinned rather than whatever the tag points at later
fn pinned_reference(image: &str, digest: &str) -> Result<String, ResolveError> {
    let reference = parse_reference(image)?;
    Ok(pin_to_digest(&reference, digest).whole())
}

/// JSON patch that sets `spec.resolvedDigest` and nothing else
///
/// `add` replaces an existing member, so a present-but-empty field is covered.
pub fn digest_patch(digest: &str) -> Patch {
    Patch(vec![PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["spec", "resolvedDigest"]),
        value: serde_json::Value::String(digest.to_string()),
    })])
}
