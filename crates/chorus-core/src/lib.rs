//! Chorus Core - shared types for the Chorus collaboration relay.
//!
//! This crate provides:
//! - Identifier newtypes ([`Did`], [`DocumentId`], [`SessionKey`],
//!   [`ClientId`], [`NodeId`])
//! - Session, update and commit records
//! - The WebSocket wire protocol (request, response and event envelopes)
//!
//! Everything in here is plain data: no I/O, no runtime dependencies.
//! The relay never interprets update payloads; they travel through these
//! types as opaque strings.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod id;
mod protocol;
mod record;

pub use id::{ClientId, Did, DocumentId, NodeId, SessionKey};
pub use protocol::{
    EventBody, EventFrame, EventKind, MembershipAction, Request, Response, commands, status,
};
pub use record::{
    CRDT_UPDATE_TYPE, DocumentCommit, DocumentUpdate, Role, Session, SessionState, now_millis,
};
