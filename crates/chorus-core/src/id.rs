//! Identifier newtypes.
//!
//! DIDs and document ids are opaque strings chosen by clients or owners;
//! the relay never parses them beyond equality and case normalization of
//! blockchain addresses. Client and node ids are minted locally as UUIDs.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A decentralized identifier — an opaque string naming a key or entity.
///
/// The relay treats DIDs as opaque: the owner DID comes from the on-chain
/// registry, the session DID is an ephemeral identity minted by the owner
/// for one collaboration session, and the server DID is loaded from
/// configuration at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    /// Wrap a DID string.
    #[must_use]
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    /// The DID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Did {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Did {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An opaque document identifier chosen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap a document id string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The document id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Node-local identifier for one WebSocket connection.
///
/// Minted on accept; never reused. Serialized as the full UUID string on
/// the wire and in the shared cache. `Ord` so client sets have a stable
/// iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Mint a fresh client id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one relay process.
///
/// Every event published on the shared bus carries the publisher's node
/// id so a node can ignore its own echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Mint a fresh node id (one per process, at startup).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", &self.0.to_string()[..8])
    }
}

/// Composite key of one collaboration session: `(document_id, session_did)`.
///
/// All session state — the node-local mirror, the shared cache record and
/// the durable row — is keyed on this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// The document this session collaborates on.
    pub document_id: DocumentId,
    /// The ephemeral session DID the owner minted for this session.
    pub session_did: Did,
}

impl SessionKey {
    /// Build a session key from its parts.
    #[must_use]
    pub fn new(document_id: DocumentId, session_did: Did) -> Self {
        Self {
            document_id,
            session_did,
        }
    }

    /// The shared-cache key for this session.
    ///
    /// Format: `collab:session:<document_id>__<session_did>`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("collab:session:{}__{}", self.document_id, self.session_did)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.document_id, self.session_did)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_roundtrip() {
        let did = Did::new("did:key:zAlice");
        assert_eq!(did.as_str(), "did:key:zAlice");
        assert_eq!(did.to_string(), "did:key:zAlice");

        let json = serde_json::to_string(&did).unwrap();
        assert_eq!(json, "\"did:key:zAlice\"");
        let back: Did = serde_json::from_str(&json).unwrap();
        assert_eq!(back, did);
    }

    #[test]
    fn test_client_ids_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn test_cache_key_format() {
        let key = SessionKey::new(DocumentId::new("d1"), Did::new("did:key:S"));
        assert_eq!(key.cache_key(), "collab:session:d1__did:key:S");
        assert_eq!(key.to_string(), "d1__did:key:S");
    }

    #[test]
    fn test_session_key_equality() {
        let a = SessionKey::new(DocumentId::new("d1"), Did::new("did:key:S"));
        let b = SessionKey::new(DocumentId::new("d1"), Did::new("did:key:S"));
        let c = SessionKey::new(DocumentId::new("d1"), Did::new("did:key:T"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
