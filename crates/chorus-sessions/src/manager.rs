//! The session manager.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as SyncRwLock};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chorus_core::{ClientId, Did, DocumentId, NodeId, Session, SessionKey, SessionState};
use chorus_events::{EventBus, SessionCache, SessionEvent, SessionEventKind};
use chorus_storage::{SessionRepository, UpdateLog};

use crate::error::{SessionError, SessionResult};

/// Local fan-out callback registered by the connection hub.
///
/// Arguments: session key, the clients to deliver to, an optional
/// exclusion (usually the sender), and the pre-serialized frame.
/// Implementations must be non-suspending: they enqueue, they do not
/// send.
pub type BroadcastHandler =
    Arc<dyn Fn(&SessionKey, &[ClientId], Option<ClientId>, &str) + Send + Sync>;

/// Authoritative session state machine for one relay node.
///
/// Owns the node-local mirror (`SessionKey → Session`, where `clients`
/// holds every client id this node has heard of — the hub filters to
/// its own sockets on delivery) and keeps it coherent with the cluster
/// via bus events.
pub struct SessionManager {
    node_id: NodeId,
    local: RwLock<HashMap<SessionKey, Session>>,
    cache: Arc<dyn SessionCache>,
    bus: Arc<dyn EventBus>,
    sessions: Arc<dyn SessionRepository>,
    log: Arc<dyn UpdateLog>,
    broadcast_handler: SyncRwLock<Option<BroadcastHandler>>,
}

impl SessionManager {
    /// Wire a manager to its backends.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        cache: Arc<dyn SessionCache>,
        bus: Arc<dyn EventBus>,
        sessions: Arc<dyn SessionRepository>,
        log: Arc<dyn UpdateLog>,
    ) -> Self {
        Self {
            node_id,
            local: RwLock::new(HashMap::new()),
            cache,
            bus,
            sessions,
            log,
            broadcast_handler: SyncRwLock::new(None),
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register the hub's local fan-out callback. One-way registration,
    /// invoked once at wiring time.
    pub fn set_broadcast_handler(&self, handler: BroadcastHandler) {
        if let Ok(mut slot) = self.broadcast_handler.write() {
            *slot = Some(handler);
        }
    }

    /// Create a session for the pair, or re-activate an `Inactive` one.
    ///
    /// The durable row is written first (it is the source of truth and
    /// the only place the terminated-pair check can be authoritative),
    /// then the local mirror and cache are warmed and the event is
    /// published. On re-activation the stored `owner_did` and
    /// `created_at` win over the caller's.
    ///
    /// # Errors
    ///
    /// [`SessionError::Terminated`] when the pair is retired;
    /// [`SessionError::Store`] when the durable write fails.
    pub async fn create_session(
        &self,
        document_id: DocumentId,
        session_did: Did,
        owner_did: Did,
        room_info: Option<serde_json::Value>,
    ) -> SessionResult<Session> {
        let candidate = Session::new(document_id, session_did, owner_did, room_info);
        let key = candidate.key();

        let existed = self.sessions.find(&key).await?.is_some();
        self.sessions.upsert_active(&candidate).await?;
        // Re-read so re-activation reflects the stored owner and
        // creation time, not the caller's.
        let session = self
            .sessions
            .find(&key)
            .await?
            .unwrap_or(candidate);

        self.local
            .write()
            .await
            .insert(key.clone(), session.clone());
        if let Err(e) = self.cache.put(&session).await {
            warn!(error = %e, session = %key, "cache write failed on create");
        }

        let kind = if existed {
            SessionEventKind::SessionUpdated {
                session: session.clone(),
            }
        } else {
            SessionEventKind::SessionCreated {
                session: session.clone(),
            }
        };
        self.publish(&key, kind).await;
        info!(session = %key, owner = %session.owner_did, existed, "session activated");
        Ok(session)
    }

    /// Three-tier session read: local map → shared cache → durable row.
    ///
    /// A cache hit for a previously unknown session warms the local
    /// map; a durable fallback warms the cache too. Terminated pairs
    /// are invisible at every tier.
    ///
    /// # Errors
    ///
    /// [`SessionError::Store`] when the durable read fails (cache
    /// errors only degrade).
    pub async fn get_session(&self, key: &SessionKey) -> SessionResult<Option<Session>> {
        if let Some(session) = self.local.read().await.get(key) {
            return Ok(Some(session.clone()));
        }

        match self.cache.get(key).await {
            Ok(Some(session)) => {
                self.local
                    .write()
                    .await
                    .entry(key.clone())
                    .or_insert_with(|| session.clone());
                return Ok(Some(session));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, session = %key, "cache read failed, falling back to store");
            }
        }

        match self.sessions.find(key).await? {
            Some(session) => {
                if let Err(e) = self.cache.put(&session).await {
                    warn!(error = %e, session = %key, "cache warm failed");
                }
                self.local
                    .write()
                    .await
                    .entry(key.clone())
                    .or_insert_with(|| session.clone());
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Add a client to an existing session.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] when no session exists for the pair.
    pub async fn add_client_to_session(
        &self,
        key: &SessionKey,
        client_id: ClientId,
    ) -> SessionResult<()> {
        if self.get_session(key).await?.is_none() {
            return Err(SessionError::NotFound(key.to_string()));
        }
        {
            let mut local = self.local.write().await;
            if let Some(session) = local.get_mut(key) {
                session.clients.insert(client_id);
                session.state = SessionState::Active;
            }
        }
        if let Err(e) = self.cache.add_client(key, client_id).await {
            warn!(error = %e, session = %key, "cache client add failed");
        }
        self.publish(key, SessionEventKind::ClientJoined { client_id })
            .await;
        debug!(session = %key, client = %client_id, "client joined");
        Ok(())
    }

    /// Remove a client; deactivates the session when the cluster-wide
    /// client set empties (local view decides if the cache is down).
    ///
    /// # Errors
    ///
    /// [`SessionError::Store`] when deactivation's durable write fails.
    pub async fn remove_client_from_session(
        &self,
        key: &SessionKey,
        client_id: ClientId,
    ) -> SessionResult<()> {
        let locally_empty = {
            let mut local = self.local.write().await;
            match local.get_mut(key) {
                Some(session) => {
                    session.clients.remove(&client_id);
                    session.clients.is_empty()
                }
                None => true,
            }
        };
        if let Err(e) = self.cache.remove_client(key, client_id).await {
            warn!(error = %e, session = %key, "cache client remove failed");
        }

        let cluster_empty = match self.cache.get(key).await {
            Ok(Some(record)) => record.clients.is_empty(),
            Ok(None) | Err(_) => locally_empty,
        };
        if cluster_empty {
            self.deactivate_session(key).await?;
        }
        self.publish(key, SessionEventKind::ClientLeft { client_id })
            .await;
        debug!(session = %key, client = %client_id, "client left");
        Ok(())
    }

    /// Drop the local entry, delete the cache key, mark the durable row
    /// `Inactive`.
    ///
    /// # Errors
    ///
    /// [`SessionError::Store`] when the durable write fails.
    pub async fn deactivate_session(&self, key: &SessionKey) -> SessionResult<()> {
        self.local.write().await.remove(key);
        if let Err(e) = self.cache.delete(key).await {
            warn!(error = %e, session = %key, "cache delete failed on deactivate");
        }
        self.sessions.set_state(key, SessionState::Inactive).await?;
        info!(session = %key, "session deactivated");
        Ok(())
    }

    /// Terminate the pair: retire the durable row, purge the update
    /// log, drop cache and local state, tell every node.
    ///
    /// # Errors
    ///
    /// [`SessionError::Store`] when the durable writes fail.
    pub async fn terminate_session(&self, key: &SessionKey) -> SessionResult<()> {
        self.local.write().await.remove(key);
        if let Err(e) = self.cache.delete(key).await {
            warn!(error = %e, session = %key, "cache delete failed on terminate");
        }
        self.sessions.terminate(key).await?;
        self.log.delete_by_session(key).await?;
        self.publish(key, SessionEventKind::SessionDeleted).await;
        info!(session = %key, "session terminated");
        Ok(())
    }

    /// Replace the session's room info everywhere. Owner-only; the
    /// caller enforces the role.
    ///
    /// # Errors
    ///
    /// [`SessionError::Store`] when the durable write fails.
    pub async fn update_room_info(
        &self,
        key: &SessionKey,
        room_info: Option<serde_json::Value>,
    ) -> SessionResult<()> {
        {
            let mut local = self.local.write().await;
            if let Some(session) = local.get_mut(key) {
                session.room_info = room_info.clone();
            }
        }
        match self.cache.get(key).await {
            Ok(Some(mut record)) => {
                record.room_info = room_info.clone();
                if let Err(e) = self.cache.put(&record).await {
                    warn!(error = %e, session = %key, "cache write failed on room info");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, session = %key, "cache read failed on room info"),
        }
        self.sessions.set_room_info(key, room_info.clone()).await?;
        self.publish(key, SessionEventKind::RoomInfoUpdated { room_info })
            .await;
        Ok(())
    }

    /// The cluster-wide client set of the session: the cached union
    /// when available, the local view otherwise.
    pub async fn peers(&self, key: &SessionKey) -> Vec<ClientId> {
        if let Ok(Some(record)) = self.cache.get(key).await {
            if !record.clients.is_empty() {
                return record.clients.into_iter().collect();
            }
        }
        self.local
            .read()
            .await
            .get(key)
            .map(|s| s.clients.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fan a pre-serialized frame out to every client of the session on
    /// every node. Local delivery happens immediately; remote nodes
    /// replay the frame when the bus event reaches them.
    pub async fn broadcast_to_all_nodes(
        &self,
        key: &SessionKey,
        payload: &str,
        exclude: Option<ClientId>,
    ) {
        self.deliver_local(key, payload, exclude).await;
        self.publish(
            key,
            SessionEventKind::BroadcastMessage {
                payload: payload.to_string(),
                exclude,
            },
        )
        .await;
    }

    /// Spawn the bus event loop. Runs until the bus subscription ends;
    /// the gateway aborts the handle on shutdown.
    #[must_use]
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut stream = manager.bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                manager.apply_event(event).await;
            }
            debug!("bus event loop ended");
        })
    }

    async fn deliver_local(&self, key: &SessionKey, payload: &str, exclude: Option<ClientId>) {
        let clients: Vec<ClientId> = self
            .local
            .read()
            .await
            .get(key)
            .map(|s| s.clients.iter().copied().collect())
            .unwrap_or_default();
        if clients.is_empty() {
            return;
        }
        let handler = self
            .broadcast_handler
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(key, &clients, exclude, payload);
        }
    }

    async fn publish(&self, key: &SessionKey, kind: SessionEventKind) {
        let event = SessionEvent::new(self.node_id, key.clone(), kind);
        if let Err(e) = self.bus.publish(&event).await {
            warn!(error = %e, kind = event.kind.tag(), session = %key, "bus publish failed");
        }
    }

    /// Apply one inbound bus event to the local mirror. Only
    /// `SESSION_CREATED` may introduce a session this node has never
    /// seen; `SESSION_DELETED` removes unconditionally.
    async fn apply_event(&self, event: SessionEvent) {
        if event.node_id == self.node_id {
            return; // own echo
        }
        match event.kind {
            SessionEventKind::SessionCreated { session } => {
                self.local
                    .write()
                    .await
                    .entry(event.key)
                    .or_insert(session);
            }
            SessionEventKind::SessionUpdated { session } => {
                if let Some(entry) = self.local.write().await.get_mut(&event.key) {
                    // Keep the client set this node has accumulated.
                    entry.state = session.state;
                    entry.room_info = session.room_info;
                }
            }
            SessionEventKind::SessionDeleted => {
                self.local.write().await.remove(&event.key);
            }
            SessionEventKind::ClientJoined { client_id } => {
                if let Some(entry) = self.local.write().await.get_mut(&event.key) {
                    entry.clients.insert(client_id);
                }
            }
            SessionEventKind::ClientLeft { client_id } => {
                if let Some(entry) = self.local.write().await.get_mut(&event.key) {
                    entry.clients.remove(&client_id);
                }
            }
            SessionEventKind::RoomInfoUpdated { room_info } => {
                if let Some(entry) = self.local.write().await.get_mut(&event.key) {
                    entry.room_info = room_info;
                }
            }
            SessionEventKind::BroadcastMessage { payload, exclude } => {
                self.deliver_local(&event.key, &payload, exclude).await;
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
