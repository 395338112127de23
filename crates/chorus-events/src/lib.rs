//! Chorus Events - shared session cache and cross-node event bus.
//!
//! Two separate concerns ride the same shared store:
//!
//! - [`SessionCache`] — cluster-visible session records under
//!   `collab:session:<document_id>__<session_did>`, 24 h TTL, refreshed
//!   on every write. Last-writer-wins; the durable row dominates on
//!   divergence.
//! - [`EventBus`] — one pub/sub channel (`session_events`) carrying
//!   [`SessionEvent`]s. Delivery is best-effort at-most-once: the bus
//!   is a soft coordination layer, not a replicated log. Every event
//!   carries the publisher's node id so subscribers can drop their own
//!   echo.
//!
//! Backends: [`MemoryBackend`] (in-process; tests and single-node
//! deployments) and [`RedisBackend`] (production, two connection
//! handles so command replies never block on subscription delivery).

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bus;
mod error;
mod event;
mod memory;
mod redis_backend;

pub use bus::{EventBus, EventStream, SESSION_CHANNEL, SESSION_TTL, SessionCache};
pub use error::{BusError, BusResult};
pub use event::{SessionEvent, SessionEventKind};
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
