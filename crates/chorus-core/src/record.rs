//! Session, update and commit records.
//!
//! These are the durable and cached shapes of the data model. Update
//! payloads are opaque client-encrypted strings; the relay stores and
//! forwards them without interpretation.

use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{ClientId, Did, DocumentId, SessionKey};

/// Tag recorded on every update row. Currently always the CRDT tag.
pub const CRDT_UPDATE_TYPE: &str = "crdt_update";

/// Milliseconds since the Unix epoch, the timestamp unit used on every
/// record and wire frame.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// At least one client is connected somewhere in the cluster.
    Active,
    /// The last client left; the pair may be revived by an owner re-setup.
    Inactive,
    /// Explicitly terminated by the owner. Sink state — never revived.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-connection role, recomputed on every `/auth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Verified the owner token; may commit, terminate and edit room info.
    Owner,
    /// Verified a collaboration token only.
    Editor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Editor => write!(f, "editor"),
        }
    }
}

/// One collaboration session, keyed by `(document_id, session_did)`.
///
/// The same shape serves the shared cache (where `clients` is the
/// cluster-wide union) and the durable row (where `clients` is not
/// maintained). `owner_did` never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// The document this session collaborates on.
    pub document_id: DocumentId,
    /// The ephemeral issuer identity the owner minted for this session.
    pub session_did: Did,
    /// Stable identity of the document owner, resolved from the registry.
    pub owner_did: Did,
    /// Opaque owner-writable metadata blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_info: Option<serde_json::Value>,
    /// Connected clients. Cluster-wide union in the shared cache record.
    #[serde(default)]
    pub clients: BTreeSet<ClientId>,
    /// Lifecycle state.
    pub state: SessionState,
    /// Creation time, ms epoch.
    pub created_at: i64,
}

impl Session {
    /// Build a fresh `Active` session with no clients.
    #[must_use]
    pub fn new(
        document_id: DocumentId,
        session_did: Did,
        owner_did: Did,
        room_info: Option<serde_json::Value>,
    ) -> Self {
        Self {
            document_id,
            session_did,
            owner_did,
            room_info,
            clients: BTreeSet::new(),
            state: SessionState::Active,
            created_at: now_millis(),
        }
    }

    /// The composite key of this session.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.document_id.clone(), self.session_did.clone())
    }
}

/// An opaque append-only update log entry.
///
/// Immutable except for the single transition
/// `committed: false → true` together with `commit_cid: None → Some(cid)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdate {
    /// Row id.
    pub id: Uuid,
    /// Document the update belongs to.
    pub document_id: DocumentId,
    /// Session under whose auth the update was accepted.
    pub session_did: Did,
    /// Opaque, client-encrypted payload.
    pub data: String,
    /// Tag string; see [`CRDT_UPDATE_TYPE`].
    pub update_type: String,
    /// Whether a commit has consumed this update.
    pub committed: bool,
    /// Content address of the consuming commit, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_cid: Option<String>,
    /// Creation time, ms epoch.
    pub created_at: i64,
}

impl DocumentUpdate {
    /// Build a fresh, uncommitted update row.
    #[must_use]
    pub fn new(document_id: DocumentId, session_did: Did, data: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            session_did,
            data: data.into(),
            update_type: CRDT_UPDATE_TYPE.to_string(),
            committed: false,
            commit_cid: None,
            created_at: now_millis(),
        }
    }
}

/// An owner-issued marker bundling update ids into an externally-addressed
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCommit {
    /// Row id.
    pub id: Uuid,
    /// Document the commit belongs to.
    pub document_id: DocumentId,
    /// Session under whose auth the commit was accepted.
    pub session_did: Did,
    /// Externally-chosen content address of the snapshot.
    pub cid: String,
    /// Update ids consumed by this commit.
    pub updates: Vec<Uuid>,
    /// Creation time, ms epoch.
    pub created_at: i64,
}

impl DocumentCommit {
    /// Build a fresh commit row.
    #[must_use]
    pub fn new(
        document_id: DocumentId,
        session_did: Did,
        cid: impl Into<String>,
        updates: Vec<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            session_did,
            cid: cid.into(),
            updates,
            created_at: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_active_and_empty() {
        let s = Session::new(
            DocumentId::new("d1"),
            Did::new("did:key:S"),
            Did::new("did:key:O"),
            None,
        );
        assert_eq!(s.state, SessionState::Active);
        assert!(s.clients.is_empty());
        assert_eq!(s.key().to_string(), "d1__did:key:S");
    }

    #[test]
    fn test_new_update_is_uncommitted() {
        let u = DocumentUpdate::new(DocumentId::new("d1"), Did::new("did:key:S"), "payload1");
        assert!(!u.committed);
        assert!(u.commit_cid.is_none());
        assert_eq!(u.update_type, CRDT_UPDATE_TYPE);
    }

    #[test]
    fn test_update_wire_shape() {
        let u = DocumentUpdate::new(DocumentId::new("d1"), Did::new("did:key:S"), "payload1");
        let json = serde_json::to_value(&u).unwrap();
        assert_eq!(json["documentId"], "d1");
        assert_eq!(json["sessionDid"], "did:key:S");
        assert_eq!(json["committed"], false);
        // Uncommitted rows omit the cid entirely.
        assert!(json.get("commitCid").is_none());
    }

    #[test]
    fn test_state_serde_tags() {
        assert_eq!(
            serde_json::to_string(&SessionState::Terminated).unwrap(),
            "\"terminated\""
        );
        assert_eq!(serde_json::to_string(&Role::Owner).unwrap(), "\"owner\"");
    }
}
