//! Chorus Capabilities - token verification and owner resolution.
//!
//! Two authorization questions are answered here:
//!
//! 1. *May this bearer create a session for this contract?* —
//!    [`TokenVerifier::verify_owner_token`], rooted at the owner DID the
//!    on-chain registry records for `(contract, collaborator)`.
//! 2. *May this bearer collaborate in this session?* —
//!    [`TokenVerifier::verify_collaboration_token`], rooted at the
//!    session's ephemeral DID.
//!
//! The concrete proof format lives behind the [`ProofVerifier`] trait so
//! the external capability-token library is replaceable; the built-in
//! [`EnvelopeVerifier`] checks ed25519-signed JSON envelopes. The
//! on-chain read lives behind [`OwnerRegistry`], wrapped by
//! [`OwnerResolver`] with a TTL cache.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod proof;
mod registry;
mod resolver;
mod verifier;

pub use error::{ProofError, ProofResult, RegistryError, RegistryResult};
pub use proof::{
    CAN_COLLABORATE, CAN_CREATE, Capability, EnvelopeIssuer, EnvelopeVerifier, ProofExpectation,
    ProofVerifier, RESOURCE_COLLABORATION, SCHEME_STORAGE, did_for_key,
};
pub use registry::{OwnerRegistry, RpcOwnerRegistry, StaticRegistry};
pub use resolver::{DEFAULT_OWNER_TTL, OwnerResolver};
pub use verifier::TokenVerifier;
