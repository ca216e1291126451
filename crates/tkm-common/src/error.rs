//! Error types shared by the TKM reconcilers

use thiserror::Error;

/// HTTP status the API server returns on a resourceVersion mismatch
const CONFLICT_STATUS: u16 = 409;

/// Failure of a reconcile pass
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API call failed
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object's spec cannot be acted on as written
    #[error("invalid {object}: {message}")]
    Validation {
        /// Name of the offending object
        object: String,
        /// What is wrong with it
        message: String,
    },

    /// A status or object body failed to (de)serialize
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error for a named object
    pub fn validation(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether running the pass again can succeed without a spec edit
    ///
    /// Kubernetes 4xx responses are permanent, except a write conflict, which
    /// only means the object moved underneath us.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == CONFLICT_STATUS || !(400..500).contains(&ae.code),
            Error::Kube { .. } | Error::Internal(_) => true,
            Error::Validation { .. } | Error::Serialization(_) => false,
        }
    }

    /// Whether this is an optimistic-concurrency write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == CONFLICT_STATUS
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
