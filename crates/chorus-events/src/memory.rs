//! In-process backend.
//!
//! One `MemoryBackend` is one "cluster": tests model multi-node
//! deployments by sharing a single instance between two hubs, and a
//! relay started without `REDISCLOUD_URL` uses a private instance
//! (single-node operation, same code paths). TTL expiry is not modeled;
//! entries live until deleted, which is what a session's lifetime
//! already guarantees.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use chorus_core::{ClientId, Session, SessionKey};

use crate::bus::{EventBus, EventStream, SessionCache};
use crate::error::BusResult;
use crate::event::SessionEvent;

/// Channel capacity for the in-process bus.
const CHANNEL_CAPACITY: usize = 1024;

/// In-process [`SessionCache`] + [`EventBus`].
pub struct MemoryBackend {
    entries: DashMap<SessionKey, Session>,
    sender: broadcast::Sender<SessionEvent>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            sender,
        }
    }

    /// Number of live subscriptions. Test hook.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionCache for MemoryBackend {
    async fn get(&self, key: &SessionKey) -> BusResult<Option<Session>> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    async fn put(&self, session: &Session) -> BusResult<()> {
        self.entries.insert(session.key(), session.clone());
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> BusResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn add_client(&self, key: &SessionKey, client_id: ClientId) -> BusResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.clients.insert(client_id);
        }
        Ok(())
    }

    async fn remove_client(&self, key: &SessionKey, client_id: ClientId) -> BusResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.clients.remove(&client_id);
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for MemoryBackend {
    async fn publish(&self, event: &SessionEvent) -> BusResult<()> {
        // No receivers is fine; the publisher's own node already
        // handled the event locally.
        let delivered = self.sender.send(event.clone()).unwrap_or(0);
        trace!(kind = event.kind.tag(), delivered, "published bus event");
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        EventStream::broadcast(self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::{Did, DocumentId, NodeId};

    use super::*;
    use crate::event::SessionEventKind;

    fn key() -> SessionKey {
        SessionKey::new(DocumentId::new("d1"), Did::new("did:key:S"))
    }

    fn session() -> Session {
        Session::new(
            DocumentId::new("d1"),
            Did::new("did:key:S"),
            Did::new("did:key:O"),
            None,
        )
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let backend = MemoryBackend::new();
        assert!(backend.get(&key()).await.unwrap().is_none());

        backend.put(&session()).await.unwrap();
        assert!(backend.get(&key()).await.unwrap().is_some());

        backend.delete(&key()).await.unwrap();
        assert!(backend.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_client_set_maintenance() {
        let backend = MemoryBackend::new();
        backend.put(&session()).await.unwrap();

        let a = ClientId::new();
        let b = ClientId::new();
        backend.add_client(&key(), a).await.unwrap();
        backend.add_client(&key(), b).await.unwrap();
        backend.remove_client(&key(), a).await.unwrap();

        let cached = backend.get(&key()).await.unwrap().unwrap();
        assert_eq!(cached.clients.len(), 1);
        assert!(cached.clients.contains(&b));
    }

    #[tokio::test]
    async fn test_add_client_without_record_is_noop() {
        let backend = MemoryBackend::new();
        backend.add_client(&key(), ClientId::new()).await.unwrap();
        assert!(backend.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let backend = MemoryBackend::new();
        let mut s1 = backend.subscribe();
        let mut s2 = backend.subscribe();

        let node = NodeId::new();
        backend
            .publish(&SessionEvent::new(node, key(), SessionEventKind::SessionDeleted))
            .await
            .unwrap();

        let e1 = s1.recv().await.unwrap();
        let e2 = s2.recv().await.unwrap();
        assert_eq!(e1.node_id, node);
        assert_eq!(e2.kind.tag(), "SESSION_DELETED");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let backend = MemoryBackend::new();
        assert!(
            backend
                .publish(&SessionEvent::new(
                    NodeId::new(),
                    key(),
                    SessionEventKind::SessionDeleted,
                ))
                .await
                .is_ok()
        );
    }
}
