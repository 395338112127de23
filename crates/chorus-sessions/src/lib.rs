//! Chorus Sessions - the authoritative session state machine.
//!
//! The [`SessionManager`] owns a node-local mirror of every session this
//! node participates in and keeps it coherent with the rest of the
//! cluster through the event bus. Reads fall through three tiers
//! (local map → shared cache → durable row), warming the inner tiers on
//! the way back; writes go to all three.
//!
//! ```text
//!  ∅ ──create_session──▶ Active ──last client leaves──▶ Inactive
//!                          │                               │
//!                          └──terminate_session───────────┤
//!                                                         ▼
//!                                                    Terminated (sink)
//! ```
//!
//! `Inactive → Active` happens implicitly when an owner re-runs setup
//! for the same pair; `Terminated` retires the pair forever and purges
//! its update log.
//!
//! Fan-out is delegated: the connection hub registers a single
//! [`BroadcastHandler`] at wiring time and the manager calls back
//! through it — for locally originated broadcasts immediately, and for
//! remote ones when the bus event arrives. The manager never owns
//! sockets.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod manager;

pub use error::{SessionError, SessionResult};
pub use manager::{BroadcastHandler, SessionManager};
