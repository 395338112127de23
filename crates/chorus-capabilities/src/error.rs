//! Capability error types.

use thiserror::Error;

/// Errors from proof verification.
///
/// Callers must not distinguish forgery from infrastructure trouble when
/// replying to clients; all variants map to an authentication failure on
/// the wire.
#[derive(Debug, Error)]
pub enum ProofError {
    /// The token is not a well-formed envelope.
    #[error("malformed proof: {0}")]
    Malformed(String),

    /// The signature does not verify under the issuer key.
    #[error("invalid signature")]
    InvalidSignature,

    /// The proof is addressed to a different audience.
    #[error("audience mismatch")]
    AudienceMismatch,

    /// The proof does not grant the required capability.
    #[error("capability mismatch: required {required}")]
    CapabilityMismatch {
        /// The capability that was required.
        required: String,
    },

    /// The proof is not rooted at the required issuer.
    #[error("root issuer mismatch")]
    RootIssuerMismatch,

    /// The proof has expired.
    #[error("proof expired")]
    Expired,
}

/// Result type for proof verification.
pub type ProofResult<T> = Result<T, ProofError>;

/// Errors from the owner registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry endpoint could not be reached.
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    /// The registry returned a malformed response.
    #[error("bad registry response: {0}")]
    BadResponse(String),
}

/// Result type for registry lookups.
pub type RegistryResult<T> = Result<T, RegistryError>;
