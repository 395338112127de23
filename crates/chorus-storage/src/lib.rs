//! Chorus Storage - durable persistence for the collaboration relay.
//!
//! Two concerns, two traits:
//!
//! - [`UpdateLog`] — the append-only log of opaque update rows and the
//!   commit markers that anchor them to external snapshots.
//! - [`SessionRepository`] — the durable session rows that survive cache
//!   eviction and node restarts.
//!
//! Backends:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`MemoryStore`] | Tests; single-process deployments without `MONGODB_URI` |
//! | [`MongoStore`] | Production (collections `sessions`, `document_updates`, `document_commits`) |
//!
//! Log rows live no longer than their session: `delete_by_session` is
//! invoked by the session manager on terminate and purges both
//! collections for the pair.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod log;
mod memory;
mod mongo;
mod sessions;

pub use error::{StoreError, StoreResult};
pub use log::{
    DEFAULT_COMMIT_LIMIT, DEFAULT_UPDATE_LIMIT, LogQuery, SortOrder, UpdateLog,
};
pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use sessions::SessionRepository;
