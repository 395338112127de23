//! Cache and bus traits.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use chorus_core::{ClientId, Session, SessionKey};

use crate::error::BusResult;
use crate::event::SessionEvent;

/// Time-to-live of cached session records, refreshed on every write.
pub const SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// The single pub/sub channel all session events travel on.
pub const SESSION_CHANNEL: &str = "session_events";

/// Cluster-wide cache of session records.
///
/// Single-key, last-writer-wins. This is a cache, not source of truth:
/// the durable session row dominates on divergence.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Read the cached record for the pair.
    ///
    /// # Errors
    ///
    /// Backend errors; callers degrade to the durable store.
    async fn get(&self, key: &SessionKey) -> BusResult<Option<Session>>;

    /// Write the record, refreshing its TTL.
    ///
    /// # Errors
    ///
    /// Backend errors; callers log and carry on.
    async fn put(&self, session: &Session) -> BusResult<()>;

    /// Drop the record.
    ///
    /// # Errors
    ///
    /// Backend errors; callers log and carry on.
    async fn delete(&self, key: &SessionKey) -> BusResult<()>;

    /// Add `client_id` to the record's cluster-wide client set.
    ///
    /// # Errors
    ///
    /// Backend errors; callers log and carry on.
    async fn add_client(&self, key: &SessionKey, client_id: ClientId) -> BusResult<()>;

    /// Remove `client_id` from the record's cluster-wide client set.
    ///
    /// # Errors
    ///
    /// Backend errors; callers log and carry on.
    async fn remove_client(&self, key: &SessionKey, client_id: ClientId) -> BusResult<()>;
}

/// The cross-node event channel.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every node (including, on some backends,
    /// the publisher — subscribers filter by node id).
    ///
    /// # Errors
    ///
    /// Backend errors; fan-out to co-located clients must not depend on
    /// publish succeeding.
    async fn publish(&self, event: &SessionEvent) -> BusResult<()>;

    /// Open a subscription. Each stream sees every event published
    /// after the call, minus whatever a transport outage drops.
    fn subscribe(&self) -> EventStream;
}

enum StreamInner {
    /// In-process broadcast subscription.
    Broadcast(broadcast::Receiver<SessionEvent>),
    /// Channel fed by a backend subscriber task.
    Channel(mpsc::Receiver<SessionEvent>),
}

/// A stream of bus events.
pub struct EventStream {
    inner: StreamInner,
}

impl EventStream {
    pub(crate) fn broadcast(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self {
            inner: StreamInner::Broadcast(rx),
        }
    }

    pub(crate) fn channel(rx: mpsc::Receiver<SessionEvent>) -> Self {
        Self {
            inner: StreamInner::Channel(rx),
        }
    }

    /// Receive the next event. Returns `None` once the bus is closed.
    ///
    /// A lagging in-process subscriber skips the dropped events and
    /// keeps receiving — consistent with the bus's at-most-once
    /// contract.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        match &mut self.inner {
            StreamInner::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(skipped = count, "bus subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            StreamInner::Channel(rx) => rx.recv().await,
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
