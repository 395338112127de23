//! Chorus Gateway - the WebSocket face of the collaboration relay.
//!
//! The [`Hub`] owns every open socket on this node: it accepts
//! upgrades, mints client ids, sends the handshake, parses request
//! frames, runs them through the [`Dispatcher`] one at a time per
//! socket, and performs local fan-out through per-socket mailboxes with
//! two backpressure classes (awareness frames are evictable, everything
//! else closes the socket on persistent overflow).
//!
//! Wiring order matters only in one place: the hub registers the
//! broadcast handler with the session manager at construction, so the
//! manager calls back through an opaque function and never owns
//! sockets.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod connection;
mod dispatch;
mod error;
mod hub;

pub use config::GatewayConfig;
pub use dispatch::Dispatcher;
pub use error::DispatchError;
pub use hub::Hub;
