//! Capability proofs - the seam to the external token library.
//!
//! The relay only ever asks one question of a token: *does this proof
//! grant capability C, addressed to audience A, rooted at issuer R?*
//! That question is the [`ProofVerifier`] trait. The deployed verifier
//! wraps whatever capability-token library the fleet standardizes on;
//! the built-in [`EnvelopeVerifier`] implements the question over
//! ed25519-signed JSON envelopes and is what the test suite and
//! single-process deployments use.
//!
//! Envelope tokens are base64url blobs of `{payload, signature}` where
//! the payload carries issuer, audience, capability triple and optional
//! expiry, and the signature is the issuer's ed25519 signature over the
//! serialized payload. The issuer DID embeds the verifying key
//! (`did:key:<base64url key bytes>`), so verification needs no key
//! directory.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Duration;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use chorus_core::{Did, now_millis};

use crate::error::{ProofError, ProofResult};

/// Capability scheme used by every collaboration grant.
pub const SCHEME_STORAGE: &str = "storage";

/// Resource named by collaboration (editor) grants.
pub const RESOURCE_COLLABORATION: &str = "collaboration";

/// Action granted by an owner token.
pub const CAN_CREATE: &str = "collaboration/CREATE";

/// Action granted by a collaboration token.
pub const CAN_COLLABORATE: &str = "collaboration/COLLABORATE";

/// Clock skew tolerated when checking expiry, in milliseconds.
const CLOCK_SKEW_MS: i64 = 30_000;

/// A capability triple: `scheme`, `resource`, `can`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Resource scheme, e.g. `storage`.
    pub scheme: String,
    /// Resource name, e.g. a lowercased contract address.
    pub resource: String,
    /// Granted action, e.g. `collaboration/CREATE`.
    pub can: String,
}

impl Capability {
    /// Build a capability triple.
    #[must_use]
    pub fn new(
        scheme: impl Into<String>,
        resource: impl Into<String>,
        can: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            resource: resource.into(),
            can: can.into(),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.scheme, self.resource, self.can)
    }
}

/// What a proof must establish to be accepted.
#[derive(Debug)]
pub struct ProofExpectation<'a> {
    /// The DID the proof must be addressed to (the server's DID).
    pub audience: &'a Did,
    /// The capability the proof must grant.
    pub capability: Capability,
    /// The DID the delegation chain must be rooted at.
    pub root_issuer: &'a Did,
}

/// Verifies capability proofs against an expectation.
///
/// Implementations must be side-effect-free and safe to call
/// concurrently.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Check `token` against `expected`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProofError`] describing the first check that failed.
    /// Callers surface every variant identically (authentication
    /// failure); the variants exist for server-side logging.
    async fn verify(&self, token: &str, expected: &ProofExpectation<'_>) -> ProofResult<()>;
}

/// Derive the `did:key` DID embedding an ed25519 verifying key.
#[must_use]
pub fn did_for_key(key: &VerifyingKey) -> Did {
    Did::new(format!("did:key:{}", URL_SAFE_NO_PAD.encode(key.as_bytes())))
}

fn key_for_did(did: &Did) -> ProofResult<VerifyingKey> {
    let encoded = did
        .as_str()
        .strip_prefix("did:key:")
        .ok_or_else(|| ProofError::Malformed(format!("not a did:key DID: {did}")))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ProofError::Malformed(format!("bad key encoding: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProofError::Malformed("key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&arr).map_err(|_| ProofError::Malformed("invalid key".to_string()))
}

/// Signed portion of an envelope token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payload {
    /// Issuer DID; embeds the verifying key.
    iss: Did,
    /// Audience DID the grant is addressed to.
    aud: Did,
    /// The granted capability.
    cap: Capability,
    /// Expiry, ms epoch. `None` means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    /// Issuance randomness; keeps otherwise-identical grants distinct.
    nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    payload: Payload,
    /// base64url ed25519 signature over the serialized payload.
    signature: String,
}

/// The built-in [`ProofVerifier`] over ed25519-signed JSON envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeVerifier;

impl EnvelopeVerifier {
    /// Create an envelope verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn check(token: &str, expected: &ProofExpectation<'_>) -> ProofResult<()> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| ProofError::Malformed(format!("bad token encoding: {e}")))?;
        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| ProofError::Malformed(format!("bad envelope: {e}")))?;

        let key = key_for_did(&envelope.payload.iss)?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(&envelope.signature)
            .map_err(|e| ProofError::Malformed(format!("bad signature encoding: {e}")))?;
        let sig_arr: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| ProofError::Malformed("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&sig_arr);

        let signed = serde_json::to_vec(&envelope.payload)
            .map_err(|e| ProofError::Malformed(format!("unserializable payload: {e}")))?;
        key.verify(&signed, &signature)
            .map_err(|_| ProofError::InvalidSignature)?;

        if envelope.payload.aud != *expected.audience {
            return Err(ProofError::AudienceMismatch);
        }
        if envelope.payload.cap != expected.capability {
            return Err(ProofError::CapabilityMismatch {
                required: expected.capability.to_string(),
            });
        }
        // Single-layer envelopes: the issuer is the root of the chain.
        if envelope.payload.iss != *expected.root_issuer {
            return Err(ProofError::RootIssuerMismatch);
        }
        if let Some(exp) = envelope.payload.exp {
            if now_millis() > exp.saturating_add(CLOCK_SKEW_MS) {
                return Err(ProofError::Expired);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProofVerifier for EnvelopeVerifier {
    async fn verify(&self, token: &str, expected: &ProofExpectation<'_>) -> ProofResult<()> {
        Self::check(token, expected)
    }
}

/// Mints envelope tokens. Used by the test suite and by operator tooling
/// that provisions single-process deployments.
pub struct EnvelopeIssuer {
    key: SigningKey,
}

impl EnvelopeIssuer {
    /// Generate an issuer with a fresh ed25519 key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// The DID of this issuer.
    #[must_use]
    pub fn did(&self) -> Did {
        did_for_key(&self.key.verifying_key())
    }

    /// Issue a token granting `capability` to `audience`.
    ///
    /// A `ttl` of `None` issues a non-expiring token.
    #[must_use]
    pub fn issue(&self, audience: &Did, capability: Capability, ttl: Option<Duration>) -> String {
        let payload = Payload {
            iss: self.did(),
            aud: audience.clone(),
            cap: capability,
            exp: ttl.map(|d| now_millis().saturating_add(d.num_milliseconds())),
            nonce: format!("{:032x}", rand::random::<u128>()),
        };
        // Serialization of a plain struct cannot fail.
        let signed = serde_json::to_vec(&payload).unwrap_or_default();
        let signature = self.key.sign(&signed);
        let envelope = Envelope {
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        };
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope).unwrap_or_default())
    }
}

impl std::fmt::Debug for EnvelopeIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeIssuer")
            .field("did", &self.did())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_did() -> Did {
        Did::new("did:key:server")
    }

    #[tokio::test]
    async fn test_valid_token_verifies() {
        let issuer = EnvelopeIssuer::generate();
        let cap = Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE);
        let token = issuer.issue(&server_did(), cap.clone(), None);

        let issuer_did = issuer.did();
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: cap,
            root_issuer: &issuer_did,
        };
        assert!(EnvelopeVerifier::new().verify(&token, &expected).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let issuer = EnvelopeIssuer::generate();
        let cap = Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE);
        let token = issuer.issue(&Did::new("did:key:other"), cap.clone(), None);

        let issuer_did = issuer.did();
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: cap,
            root_issuer: &issuer_did,
        };
        assert!(matches!(
            EnvelopeVerifier::new().verify(&token, &expected).await,
            Err(ProofError::AudienceMismatch)
        ));
    }

    #[tokio::test]
    async fn test_wrong_capability_rejected() {
        let issuer = EnvelopeIssuer::generate();
        let token = issuer.issue(
            &server_did(),
            Capability::new(SCHEME_STORAGE, "0xaa", CAN_COLLABORATE),
            None,
        );

        let issuer_did = issuer.did();
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE),
            root_issuer: &issuer_did,
        };
        assert!(matches!(
            EnvelopeVerifier::new().verify(&token, &expected).await,
            Err(ProofError::CapabilityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_root_issuer_rejected() {
        let issuer = EnvelopeIssuer::generate();
        let imposter = EnvelopeIssuer::generate();
        let cap = Capability::new(SCHEME_STORAGE, RESOURCE_COLLABORATION, CAN_COLLABORATE);
        let token = issuer.issue(&server_did(), cap.clone(), None);

        let imposter_did = imposter.did();
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: cap,
            root_issuer: &imposter_did,
        };
        assert!(matches!(
            EnvelopeVerifier::new().verify(&token, &expected).await,
            Err(ProofError::RootIssuerMismatch)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let issuer = EnvelopeIssuer::generate();
        let cap = Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE);
        // Expired a minute ago, beyond the 30s skew tolerance.
        let token = issuer.issue(&server_did(), cap.clone(), Some(Duration::seconds(-60)));

        let issuer_did = issuer.did();
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: cap,
            root_issuer: &issuer_did,
        };
        assert!(matches!(
            EnvelopeVerifier::new().verify(&token, &expected).await,
            Err(ProofError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_just_expired_within_skew_accepted() {
        let issuer = EnvelopeIssuer::generate();
        let cap = Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE);
        let token = issuer.issue(&server_did(), cap.clone(), Some(Duration::seconds(-10)));

        let issuer_did = issuer.did();
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: cap,
            root_issuer: &issuer_did,
        };
        assert!(EnvelopeVerifier::new().verify(&token, &expected).await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_token_rejected() {
        let issuer = EnvelopeIssuer::generate();
        let cap = Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE);
        let token = issuer.issue(&server_did(), cap.clone(), None);

        // Re-encode the envelope with an upgraded capability.
        let raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        envelope["payload"]["cap"]["resource"] = "0xbb".into();
        let forged = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope).unwrap());

        let issuer_did = issuer.did();
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: Capability::new(SCHEME_STORAGE, "0xbb", CAN_CREATE),
            root_issuer: &issuer_did,
        };
        assert!(matches!(
            EnvelopeVerifier::new().verify(&forged, &expected).await,
            Err(ProofError::InvalidSignature)
        ));
    }

    #[test]
    fn test_garbage_token_malformed() {
        let expected = ProofExpectation {
            audience: &server_did(),
            capability: Capability::new(SCHEME_STORAGE, "0xaa", CAN_CREATE),
            root_issuer: &server_did(),
        };
        assert!(matches!(
            EnvelopeVerifier::check("not a token !!!", &expected),
            Err(ProofError::Malformed(_))
        ));
    }
}
