//! Durable session rows.

use async_trait::async_trait;

use chorus_core::{Session, SessionKey, SessionState};

use crate::error::StoreResult;

/// Persistence of session rows keyed by `(document_id, session_did)`.
///
/// The durable row is the source of truth on divergence from the shared
/// cache. `owner_did` is written once at creation and never changes;
/// re-setup of an `Inactive` pair flips the state back to `Active`
/// without touching it.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert the session as `Active`, or flip an existing
    /// non-terminated row back to `Active` (updating `room_info`,
    /// keeping the stored `owner_did` and `created_at`).
    ///
    /// # Errors
    ///
    /// [`StoreError::SessionTerminated`](crate::StoreError::SessionTerminated)
    /// if the pair was terminated — terminated pairs are permanently
    /// retired. Backend errors otherwise.
    async fn upsert_active(&self, session: &Session) -> StoreResult<()>;

    /// Load the row for the pair. Terminated rows are invisible: the
    /// pair is retired, so callers treat it as nonexistent.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    async fn find(&self, key: &SessionKey) -> StoreResult<Option<Session>>;

    /// Set the lifecycle state of an existing row. No-op if the row
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    async fn set_state(&self, key: &SessionKey, state: SessionState) -> StoreResult<()>;

    /// Replace the owner-writable room info of an existing row.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    async fn set_room_info(
        &self,
        key: &SessionKey,
        room_info: Option<serde_json::Value>,
    ) -> StoreResult<()>;

    /// Terminate the pair: state becomes `Terminated` and room info is
    /// cleared. Idempotent.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    async fn terminate(&self, key: &SessionKey) -> StoreResult<()>;
}
