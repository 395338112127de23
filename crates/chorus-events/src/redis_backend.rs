//! Redis backend.
//!
//! Two connection handles: a [`ConnectionManager`] for request/response
//! commands (cache reads/writes, PUBLISH) and a dedicated pub/sub
//! connection owned by the subscriber task, so command replies never
//! block on subscription delivery. The subscriber reconnects with
//! capped exponential backoff; while it is down, local fan-out still
//! works for co-located participants.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chorus_core::{ClientId, Session, SessionKey};

use crate::bus::{EventBus, EventStream, SESSION_CHANNEL, SESSION_TTL, SessionCache};
use crate::error::{BusError, BusResult};
use crate::event::SessionEvent;

/// Queue depth between the subscriber task and each consumer.
const SUBSCRIBER_QUEUE: usize = 1024;

/// First reconnect delay; doubles per attempt up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Redis-backed [`SessionCache`] + [`EventBus`].
pub struct RedisBackend {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisBackend {
    /// Connect to `url` (e.g. the `REDISCLOUD_URL` value).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Cache`] if the initial connection fails.
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url).map_err(|e| BusError::Cache(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Cache(e.to_string()))?;
        info!("connected to shared session cache");
        Ok(Self { manager, client })
    }

    fn encode(session: &Session) -> BusResult<String> {
        serde_json::to_string(session).map_err(|e| BusError::Serialization(e.to_string()))
    }

    fn decode(raw: &str) -> BusResult<Session> {
        serde_json::from_str(raw).map_err(|e| BusError::Serialization(e.to_string()))
    }

    async fn write(&self, session: &Session) -> BusResult<()> {
        let mut con = self.manager.clone();
        con.set_ex::<_, _, ()>(
            session.key().cache_key(),
            Self::encode(session)?,
            SESSION_TTL.as_secs(),
        )
        .await
        .map_err(|e| BusError::Cache(e.to_string()))
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionCache for RedisBackend {
    async fn get(&self, key: &SessionKey) -> BusResult<Option<Session>> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con
            .get(key.cache_key())
            .await
            .map_err(|e| BusError::Cache(e.to_string()))?;
        raw.as_deref().map(Self::decode).transpose()
    }

    async fn put(&self, session: &Session) -> BusResult<()> {
        self.write(session).await
    }

    async fn delete(&self, key: &SessionKey) -> BusResult<()> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key.cache_key())
            .await
            .map_err(|e| BusError::Cache(e.to_string()))
    }

    async fn add_client(&self, key: &SessionKey, client_id: ClientId) -> BusResult<()> {
        // Read-modify-write; single-key last-writer-wins is acceptable
        // for the cached client set, the durable row dominates anyway.
        if let Some(mut session) = self.get(key).await? {
            session.clients.insert(client_id);
            self.write(&session).await?;
        }
        Ok(())
    }

    async fn remove_client(&self, key: &SessionKey, client_id: ClientId) -> BusResult<()> {
        if let Some(mut session) = self.get(key).await? {
            session.clients.remove(&client_id);
            self.write(&session).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisBackend {
    async fn publish(&self, event: &SessionEvent) -> BusResult<()> {
        let payload =
            serde_json::to_string(event).map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut con = self.manager.clone();
        con.publish::<_, _, ()>(SESSION_CHANNEL, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let client = self.client.clone();
        tokio::spawn(subscriber_loop(client, tx));
        EventStream::channel(rx)
    }
}

/// Owns the pub/sub connection; reconnects on transient failure until
/// the consuming [`EventStream`] is dropped.
async fn subscriber_loop(client: redis::Client, tx: mpsc::Sender<SessionEvent>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match subscribe_once(&client, &tx).await {
            Ok(()) => return, // consumer gone, clean exit
            Err(e) => {
                warn!(error = %e, delay = ?backoff, "bus subscription lost, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff.saturating_mul(2)).min(MAX_BACKOFF);
            }
        }
        if tx.is_closed() {
            return;
        }
    }
}

async fn subscribe_once(
    client: &redis::Client,
    tx: &mpsc::Sender<SessionEvent>,
) -> Result<(), redis::RedisError> {
    let connection = client.get_async_connection().await?;
    let mut pubsub = connection.into_pubsub();
    pubsub.subscribe(SESSION_CHANNEL).await?;
    debug!(channel = SESSION_CHANNEL, "bus subscription established");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = msg.get_payload()?;
        match serde_json::from_str::<SessionEvent>(&payload) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                // A malformed event is dropped, not fatal: one bad
                // publisher must not take down the subscription.
                warn!(error = %e, "unparseable bus event dropped");
            }
        }
    }
    Err(redis::RedisError::from(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "pub/sub stream ended",
    )))
}
