//! Container image references
//!
//! Parsing and normalization come from `oci_client`, which is also what the
//! Sigstore client parses with, so the resolver and the verifier always agree
//! on which manifest a string names. A bare name lives on Docker Hub under
//! `library/`.

use oci_client::Reference;
use thiserror::Error;

/// Why a reference failed to parse
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// Nothing to parse
    #[error("image reference is empty")]
    Empty,

    /// Not a valid `[registry/]repository[:tag][@digest]`
    #[error("{reference:?}: {message}")]
    Malformed {
        /// The input as given
        reference: String,
        /// Parser error
        message: String,
    },
}

/// Parse and normalize an image reference
pub fn parse_reference(image: &str) -> Result<Reference, ReferenceError> {
    if image.is_empty() {
        return Err(ReferenceError::Empty);
    }
    Reference::try_from(image).map_err(|e| ReferenceError::Malformed {
        reference: image.to_string(),
        message: e.to_string(),
    })
}

/// The same repository addressed by `digest` alone
pub fn pin_to_digest(reference: &Reference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}
