//! The two verification contracts of the relay.
//!
//! Owner tokens authorize session *creation* for a contract and are
//! rooted at the owner DID the registry records. Collaboration tokens
//! authorize *participation* and are rooted at the session's ephemeral
//! DID. Both are audience-scoped to this server's DID.

use std::sync::Arc;

use tracing::debug;

use chorus_core::Did;

use crate::proof::{
    CAN_COLLABORATE, CAN_CREATE, Capability, ProofExpectation, ProofVerifier,
    RESOURCE_COLLABORATION, SCHEME_STORAGE,
};
use crate::resolver::OwnerResolver;

/// Verifies owner and collaboration capability tokens.
///
/// Side-effect-free; safe to share across all connection tasks.
pub struct TokenVerifier {
    server_did: Did,
    proofs: Arc<dyn ProofVerifier>,
    owners: Arc<OwnerResolver>,
}

impl TokenVerifier {
    /// Build a verifier for this server's DID.
    #[must_use]
    pub fn new(server_did: Did, proofs: Arc<dyn ProofVerifier>, owners: Arc<OwnerResolver>) -> Self {
        Self {
            server_did,
            proofs,
            owners,
        }
    }

    /// The DID all proofs must be addressed to.
    #[must_use]
    pub fn server_did(&self) -> &Did {
        &self.server_did
    }

    /// Verify an owner token for `contract_address`, presented by
    /// `collaborator_address`.
    ///
    /// Resolves the expected owner through the registry, then checks the
    /// proof against capability
    /// `storage:<lowercase contract>#collaboration/CREATE` rooted at that
    /// owner. Returns the owner DID on success, `None` on any failure —
    /// including registry unavailability, which is indistinguishable
    /// from forgery by design.
    pub async fn verify_owner_token(
        &self,
        token: &str,
        contract_address: &str,
        collaborator_address: &str,
    ) -> Option<Did> {
        let owner_did = self
            .owners
            .resolve(contract_address, collaborator_address)
            .await?;

        let expected = ProofExpectation {
            audience: &self.server_did,
            capability: Capability::new(
                SCHEME_STORAGE,
                contract_address.to_lowercase(),
                CAN_CREATE,
            ),
            root_issuer: &owner_did,
        };
        match self.proofs.verify(token, &expected).await {
            Ok(()) => Some(owner_did),
            Err(e) => {
                debug!(error = %e, contract = contract_address, "owner token rejected");
                None
            }
        }
    }

    /// Verify a collaboration token rooted at `session_did`.
    pub async fn verify_collaboration_token(&self, token: &str, session_did: &Did) -> bool {
        let expected = ProofExpectation {
            audience: &self.server_did,
            capability: Capability::new(SCHEME_STORAGE, RESOURCE_COLLABORATION, CAN_COLLABORATE),
            root_issuer: session_did,
        };
        match self.proofs.verify(token, &expected).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, session_did = %session_did, "collaboration token rejected");
                false
            }
        }
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("server_did", &self.server_did)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::proof::{EnvelopeIssuer, EnvelopeVerifier};
    use crate::registry::StaticRegistry;

    fn verifier_for(owner: &EnvelopeIssuer) -> (TokenVerifier, Did) {
        let server_did = Did::new("did:key:server");
        let registry = StaticRegistry::new().with_owner("0xAA", "0xBB", owner.did());
        let verifier = TokenVerifier::new(
            server_did.clone(),
            Arc::new(EnvelopeVerifier::new()),
            Arc::new(OwnerResolver::new(Arc::new(registry))),
        );
        (verifier, server_did)
    }

    #[tokio::test]
    async fn test_owner_token_resolves_owner_did() {
        let owner = EnvelopeIssuer::generate();
        let (verifier, server_did) = verifier_for(&owner);

        let token = owner.issue(
            &server_did,
            Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE),
            Some(Duration::hours(1)),
        );
        let resolved = verifier.verify_owner_token(&token, "0xAA", "0xBB").await;
        assert_eq!(resolved, Some(owner.did()));
    }

    #[tokio::test]
    async fn test_owner_token_unknown_pair_fails() {
        let owner = EnvelopeIssuer::generate();
        let (verifier, server_did) = verifier_for(&owner);

        let token = owner.issue(
            &server_did,
            Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE),
            None,
        );
        // No registry entry for this contract.
        assert!(
            verifier
                .verify_owner_token(&token, "0xCC", "0xBB")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_owner_token_contract_is_lowercased() {
        let owner = EnvelopeIssuer::generate();
        let (verifier, server_did) = verifier_for(&owner);

        // Token resource must match the lowercased contract address even
        // when the wire carries mixed case.
        let token = owner.issue(
            &server_did,
            Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE),
            None,
        );
        assert!(
            verifier
                .verify_owner_token(&token, "0xAA", "0xBB")
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_collaboration_token_rooted_at_session() {
        let owner = EnvelopeIssuer::generate();
        let (verifier, server_did) = verifier_for(&owner);

        let session = EnvelopeIssuer::generate();
        let token = session.issue(
            &server_did,
            Capability::new(SCHEME_STORAGE, RESOURCE_COLLABORATION, CAN_COLLABORATE),
            Some(Duration::hours(1)),
        );
        assert!(
            verifier
                .verify_collaboration_token(&token, &session.did())
                .await
        );
        // Rooted at a different session DID: rejected.
        let other = EnvelopeIssuer::generate();
        assert!(
            !verifier
                .verify_collaboration_token(&token, &other.did())
                .await
        );
    }

    #[tokio::test]
    async fn test_owner_token_not_valid_as_collaboration_token() {
        let owner = EnvelopeIssuer::generate();
        let (verifier, server_did) = verifier_for(&owner);

        let token = owner.issue(
            &server_did,
            Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE),
            None,
        );
        assert!(!verifier.verify_collaboration_token(&token, &owner.did()).await);
    }
}
