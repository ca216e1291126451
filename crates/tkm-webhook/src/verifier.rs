//! Keyless cosign signature verification
//!
//! Signatures are trusted through Sigstore: Fulcio-issued short-lived
//! certificates, Rekor inclusion bundles, and a trust root fetched over TUF.
//! There are no static public keys to distribute or rotate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sigstore::cosign::signature_layers::{CertificateSubject, SignatureLayer};
use sigstore::cosign::{ClientBuilder, CosignCapabilities};
use sigstore::registry::{Auth, ClientConfig, ClientProtocol, OciReference};
use sigstore::trust::sigstore::SigstoreTrustRoot;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

/// Errors from the verification machinery itself
///
/// Finding zero valid signatures is not an error; see [`Verification`].
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The reference could not be parsed
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// Trust root, registry, or signature processing failed
    #[error("{0}")]
    Verification(String),

    /// The deadline elapsed
    #[error("signature verification timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a verification run that completed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Verification {
    /// At least one signature passed every check
    pub verified: bool,
    /// How many signatures passed every check
    pub signature_count: usize,
}

impl Verification {
    /// Build from the number of valid signatures found
    pub fn from_count(signature_count: usize) -> Self {
        Self {
            verified: signature_count > 0,
            signature_count,
        }
    }
}

/// Checks that an image carries trusted signatures
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Verify signatures for an image reference, ideally pinned by digest
    async fn verify(&self, image: &str) -> Result<Verification, VerifyError>;
}

/// Who must have signed an image
///
/// Unset fields accept any value. The identity is matched against the
/// certificate's email or URI subject.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignerIdentity {
    /// Expected certificate subject
    pub identity: Option<String>,
    /// Expected OIDC issuer
    pub issuer: Option<String>,
}

impl SignerIdentity {
    /// Whether a certificate's subject and issuer satisfy this constraint
    pub fn matches(&self, subject: &str, issuer: Option<&str>) -> bool {
        let identity_ok = self.identity.as_deref().is_none_or(|want| want == subject);
        let issuer_ok = self
            .issuer
            .as_deref()
            .is_none_or(|want| issuer == Some(want));
        identity_ok && issuer_ok
    }
}

/// [`SignatureVerifier`] for cosign keyless signatures
pub struct CosignVerifier {
    signer: SignerIdentity,
    insecure_registries: Vec<String>,
    trust_root: OnceCell<Arc<SigstoreTrustRoot>>,
}

impl CosignVerifier {
    /// Create a verifier; the trust root is fetched on first use
    pub fn new(signer: SignerIdentity, insecure_registries: Vec<String>) -> Self {
        Self {
            signer,
            insecure_registries,
            trust_root: OnceCell::new(),
        }
    }

    async fn trust_root(&self) -> Result<Arc<SigstoreTrustRoot>, VerifyError> {
        self.trust_root
            .get_or_try_init(|| async {
                info!("fetching Sigstore trust root");
                SigstoreTrustRoot::new(None)
                    .await
                    .map(Arc::new)
                    .map_err(|e| VerifyError::Verification(format!("trust root: {e}")))
            })
            .await
            .cloned()
    }

    fn count_valid(&self, layers: &[SignatureLayer], digest: &str) -> usize {
        layers
            .iter()
            .filter(|layer| layer.bundle.is_some())
            .filter(|layer| layer.simple_signing.critical.image.docker_manifest_digest == digest)
            .filter(|layer| {
                layer.certificate_signature.as_ref().is_some_and(|cert| {
                    let subject = match &cert.subject {
                        CertificateSubject::Email(email) => email.as_str(),
                        CertificateSubject::Uri(uri) => uri.as_str(),
                    };
                    self.signer.matches(subject, cert.issuer.as_deref())
                })
            })
            .count()
    }
}

#[async_trait]
impl SignatureVerifier for CosignVerifier {
    #[instrument(skip(self))]
    async fn verify(&self, image: &str) -> Result<Verification, VerifyError> {
        let reference: OciReference = image
            .parse()
            .map_err(|e| VerifyError::InvalidReference(format!("{image}: {e}")))?;

        let trust_root = self.trust_root().await?;
        let oci_config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(self.insecure_registries.clone()),
            ..Default::default()
        };
        let mut client = ClientBuilder::default()
            .with_oci_client_config(oci_config)
            .with_trust_repository(trust_root.as_ref())
            .and_then(ClientBuilder::build)
            .map_err(|e| VerifyError::Verification(e.to_string()))?;

        let auth = Auth::Anonymous;
        let (signature_image, digest) = client
            .triangulate(&reference, &auth)
            .await
            .map_err(|e| VerifyError::Verification(e.to_string()))?;
        debug!(%signature_image, %digest, "located cosign signature image");

        let layers = client
            .trusted_signature_layers(&auth, &digest, &signature_image)
            .await
            .map_err(|e| VerifyError::Verification(e.to_string()))?;

        let verification = Verification::from_count(self.count_valid(&layers, &digest));
        info!(
            image,
            layers = layers.len(),
            valid = verification.signature_count,
            "verified cosign signatures"
        );
        Ok(verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_from_count() {
        assert_eq!(
            Verification::from_count(0),
            Verification {
                verified: false,
                signature_count: 0
            }
        );
        assert!(Verification::from_count(2).verified);
    }

    #[test]
    fn test_unconstrained_signer_accepts_anyone() {
        let signer = SignerIdentity::default();
        assert!(signer.matches("someone@example.com", None));
        assert!(signer.matches("https://github.com/org/repo/.github/workflows/release.yml@refs/heads/main", Some("https://token.actions.githubusercontent.com")));
    }

    #[test]
    fn test_identity_and_issuer_constraints() {
        let signer = SignerIdentity {
            identity: Some("release@tkm.io".to_string()),
            issuer: Some("https://accounts.google.com".to_string()),
        };
        assert!(signer.matches("release@tkm.io", Some("https://accounts.google.com")));
        assert!(!signer.matches("release@tkm.io", Some("https://github.com/login/oauth")));
        assert!(!signer.matches("release@tkm.io", None));
        assert!(!signer.matches("attacker@example.com", Some("https://accounts.google.com")));
    }

    #[tokio::test]
    async fn test_malformed_reference_is_rejected_before_trust_root() {
        let verifier = CosignVerifier::new(SignerIdentity::default(), Vec::new());
        let err = verifier.verify("not a reference!").await.unwrap_err();
        assert!(matches!(err, VerifyError::InvalidReference(_)), "{err:?}");
        assert!(verifier.trust_root.get().is_none());
    }
}
