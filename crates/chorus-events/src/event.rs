//! Bus event types.

use serde::{Deserialize, Serialize};

use chorus_core::{ClientId, NodeId, Session, SessionKey};

/// What happened to a session. Tag spellings are the bus wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionEventKind {
    /// A session was created somewhere in the cluster.
    #[serde(rename = "SESSION_CREATED")]
    SessionCreated {
        /// The created session record.
        session: Session,
    },
    /// A session record changed (state or metadata).
    #[serde(rename = "SESSION_UPDATED")]
    SessionUpdated {
        /// The updated session record.
        session: Session,
    },
    /// A session was terminated; subscribers drop their local entry.
    #[serde(rename = "SESSION_DELETED")]
    SessionDeleted,
    /// A client joined the session on the publishing node.
    #[serde(rename = "CLIENT_JOINED")]
    ClientJoined {
        /// The joining client.
        client_id: ClientId,
    },
    /// A client left the session on the publishing node.
    #[serde(rename = "CLIENT_LEFT")]
    ClientLeft {
        /// The leaving client.
        client_id: ClientId,
    },
    /// The owner replaced the session's room info.
    #[serde(rename = "ROOM_INFO_UPDATED")]
    RoomInfoUpdated {
        /// The new room info blob.
        room_info: Option<serde_json::Value>,
    },
    /// A frame to fan out to the session's local clients on every node.
    #[serde(rename = "BROADCAST_MESSAGE")]
    BroadcastMessage {
        /// The pre-serialized event frame.
        payload: String,
        /// Client that must not receive the frame (usually the sender).
        exclude: Option<ClientId>,
    },
}

impl SessionEventKind {
    /// The wire tag of this kind, for logging.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "SESSION_CREATED",
            Self::SessionUpdated { .. } => "SESSION_UPDATED",
            Self::SessionDeleted => "SESSION_DELETED",
            Self::ClientJoined { .. } => "CLIENT_JOINED",
            Self::ClientLeft { .. } => "CLIENT_LEFT",
            Self::RoomInfoUpdated { .. } => "ROOM_INFO_UPDATED",
            Self::BroadcastMessage { .. } => "BROADCAST_MESSAGE",
        }
    }
}

/// One message on the session bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// The node that published the event. Subscribers ignore their own.
    pub node_id: NodeId,
    /// The session the event belongs to.
    pub key: SessionKey,
    /// What happened.
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    /// Build an event published by `node_id`.
    #[must_use]
    pub fn new(node_id: NodeId, key: SessionKey, kind: SessionEventKind) -> Self {
        Self { node_id, key, kind }
    }
}
