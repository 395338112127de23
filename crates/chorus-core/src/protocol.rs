//! WebSocket wire protocol.
//!
//! Three envelope shapes travel over a connection:
//!
//! - [`Request`] (client → server): `{"cmd", "args", "seqId"}`
//! - [`Response`] (server → client, sequenced): `{"status", "statusCode",
//!   "seqId", "is_handshake_response", "data"?, "err"?}`
//! - [`EventFrame`] (server → clients, unsolicited): `{"type",
//!   "event_type", "event": {"data", "roomId"}}`
//!
//! All frames are JSON text. Field spellings are fixed by the protocol
//! and do not follow one casing convention; the serde attributes below
//! are the source of truth.

use serde::{Deserialize, Serialize};

use crate::id::{ClientId, Did, DocumentId};

/// Wire command names.
pub mod commands {
    /// Authenticate a socket and create or join a session.
    pub const AUTH: &str = "/auth";
    /// Persist and fan out a CRDT update.
    pub const DOCUMENT_UPDATE: &str = "/documents/update";
    /// Anchor updates to an external snapshot.
    pub const DOCUMENT_COMMIT: &str = "/documents/commit";
    /// Page through the update log.
    pub const UPDATE_HISTORY: &str = "/documents/update/history";
    /// Page through the commit log.
    pub const COMMIT_HISTORY: &str = "/documents/commit/history";
    /// List the cluster-wide client set of the session.
    pub const PEERS_LIST: &str = "/documents/peers/list";
    /// Fan out ephemeral presence data.
    pub const AWARENESS: &str = "/documents/awareness";
    /// Terminate the session and purge its log.
    pub const TERMINATE: &str = "/documents/terminate";
}

/// Wire status codes.
pub mod status {
    /// Success.
    pub const OK: u16 = 200;
    /// Malformed frame or missing/invalid arguments.
    pub const BAD_REQUEST: u16 = 400;
    /// Unauthenticated socket or token verification failure.
    pub const UNAUTHORIZED: u16 = 401;
    /// Authenticated but role insufficient.
    pub const FORBIDDEN: u16 = 403;
    /// Unknown command or no such session.
    pub const NOT_FOUND: u16 = 404;
    /// Internal or external-dependency failure.
    pub const INTERNAL: u16 = 500;
}

/// A client request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command name, e.g. `/auth`.
    pub cmd: String,
    /// Command arguments; shape depends on the command.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Client-chosen correlation id echoed on the reply.
    #[serde(rename = "seqId", default)]
    pub seq_id: Option<String>,
}

/// A sequenced server reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// `true` iff `status_code` is 200.
    pub status: bool,
    /// Wire status code; see [`status`].
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Correlation id of the request, or `None` for unparseable frames
    /// and the handshake.
    #[serde(rename = "seqId")]
    pub seq_id: Option<String>,
    /// Set on the single handshake frame sent when a socket connects.
    pub is_handshake_response: bool,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message for non-200 replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    /// A 200 reply carrying `data`.
    #[must_use]
    pub fn ok(seq_id: Option<String>, data: serde_json::Value) -> Self {
        Self {
            status: true,
            status_code: status::OK,
            seq_id,
            is_handshake_response: false,
            data: Some(data),
            err: None,
        }
    }

    /// An error reply with the given status code and message.
    #[must_use]
    pub fn error(seq_id: Option<String>, status_code: u16, err: impl Into<String>) -> Self {
        Self {
            status: false,
            status_code,
            seq_id,
            is_handshake_response: false,
            data: None,
            err: Some(err.into()),
        }
    }

    /// The handshake frame sent immediately after a socket is accepted.
    #[must_use]
    pub fn handshake(server_did: &Did) -> Self {
        Self {
            status: true,
            status_code: status::OK,
            seq_id: None,
            is_handshake_response: true,
            data: Some(serde_json::json!({
                "server_did": server_did,
                "message": "connected",
            })),
            err: None,
        }
    }
}

/// Kinds of unsolicited server → client events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A new update row was appended; carries `{id, data, createdAt}`.
    #[serde(rename = "CONTENT_UPDATE")]
    ContentUpdate,
    /// Ephemeral presence data; never persisted.
    #[serde(rename = "AWARENESS_UPDATE")]
    AwarenessUpdate,
    /// A client joined or left the session.
    #[serde(rename = "ROOM_MEMBERSHIP_CHANGE")]
    RoomMembershipChange,
    /// The owner terminated the session.
    #[serde(rename = "SESSION_TERMINATED")]
    SessionTerminated,
}

impl EventKind {
    /// Whether frames of this kind may be evicted from a backlogged
    /// send queue. Awareness is idempotent-by-latest; everything else is
    /// delivery-guaranteed.
    #[must_use]
    pub fn is_droppable(self) -> bool {
        matches!(self, Self::AwarenessUpdate)
    }
}

/// Membership change actions carried by `ROOM_MEMBERSHIP_CHANGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    /// A client authenticated into the session.
    UserJoined,
    /// A client disconnected or left.
    UserLeft,
}

/// Payload of an [`EventFrame`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBody {
    /// Event data; shape depends on the kind.
    pub data: serde_json::Value,
    /// The document id the event belongs to.
    #[serde(rename = "roomId")]
    pub room_id: DocumentId,
}

/// An unsolicited server → client event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    /// Always `"event"`.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Event kind tag.
    pub event_type: EventKind,
    /// Event payload.
    pub event: EventBody,
}

impl EventFrame {
    /// Build an event frame for `room_id` carrying `data`.
    #[must_use]
    pub fn new(kind: EventKind, room_id: DocumentId, data: serde_json::Value) -> Self {
        Self {
            frame_type: "event".to_string(),
            event_type: kind,
            event: EventBody { data, room_id },
        }
    }

    /// A membership-change frame for `client_id`.
    #[must_use]
    pub fn membership(
        room_id: DocumentId,
        action: MembershipAction,
        client_id: ClientId,
    ) -> Self {
        Self::new(
            EventKind::RoomMembershipChange,
            room_id,
            serde_json::json!({ "action": action, "clientId": client_id }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Did;

    #[test]
    fn test_request_parses_wire_casing() {
        let req: Request =
            serde_json::from_str(r#"{"cmd":"/auth","args":{"documentId":"d1"},"seqId":"7"}"#)
                .unwrap();
        assert_eq!(req.cmd, commands::AUTH);
        assert_eq!(req.seq_id.as_deref(), Some("7"));
        assert_eq!(req.args["documentId"], "d1");
    }

    #[test]
    fn test_request_seq_id_optional() {
        let req: Request = serde_json::from_str(r#"{"cmd":"/auth"}"#).unwrap();
        assert!(req.seq_id.is_none());
        assert!(req.args.is_null());
    }

    #[test]
    fn test_handshake_shape() {
        let frame = Response::handshake(&Did::new("did:key:server"));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["is_handshake_response"], true);
        assert_eq!(json["data"]["server_did"], "did:key:server");
        assert!(json["seqId"].is_null());
    }

    #[test]
    fn test_error_reply_shape() {
        let frame = Response::error(Some("3".into()), status::UNAUTHORIZED, "invalid token");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["status"], false);
        assert_eq!(json["statusCode"], 401);
        assert_eq!(json["seqId"], "3");
        assert_eq!(json["err"], "invalid token");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_event_frame_shape() {
        let frame = EventFrame::new(
            EventKind::ContentUpdate,
            DocumentId::new("d1"),
            serde_json::json!({"data": "payload1"}),
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event_type"], "CONTENT_UPDATE");
        assert_eq!(json["event"]["roomId"], "d1");
        assert_eq!(json["event"]["data"]["data"], "payload1");
    }

    #[test]
    fn test_membership_frame() {
        let id = ClientId::new();
        let frame = EventFrame::membership(DocumentId::new("d1"), MembershipAction::UserLeft, id);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event_type"], "ROOM_MEMBERSHIP_CHANGE");
        assert_eq!(json["event"]["data"]["action"], "user_left");
        assert_eq!(json["event"]["data"]["clientId"], id.to_string());
    }

    #[test]
    fn test_droppable_classes() {
        assert!(EventKind::AwarenessUpdate.is_droppable());
        assert!(!EventKind::ContentUpdate.is_droppable());
        assert!(!EventKind::RoomMembershipChange.is_droppable());
        assert!(!EventKind::SessionTerminated.is_droppable());
    }
}
