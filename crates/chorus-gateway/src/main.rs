//! `chorusd` — one Chorus collaboration relay node.
//!
//! Thin entry point: parse environment configuration, size the runtime,
//! wire the process-wide singletons (verifier, resolver, store, cache +
//! bus, session manager, hub), serve until interrupted, then shut down
//! gracefully (stop accepting, close sockets, stop the bus loop,
//! let backend connections drop).

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chorus_capabilities::{
    EnvelopeVerifier, OwnerRegistry, OwnerResolver, RpcOwnerRegistry, StaticRegistry,
    TokenVerifier,
};
use chorus_core::{Did, NodeId};
use chorus_events::{EventBus, MemoryBackend, RedisBackend, SessionCache};
use chorus_gateway::{Dispatcher, GatewayConfig, Hub};
use chorus_sessions::SessionManager;
use chorus_storage::{MemoryStore, MongoStore, SessionRepository, UpdateLog};

fn main() -> Result<()> {
    let config = GatewayConfig::parse();
    init_logging(&config);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.web_concurrency {
        builder.worker_threads(workers.max(1));
    }
    let runtime = builder.build().context("failed to build runtime")?;
    runtime.block_on(serve(config))
}

fn init_logging(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.is_production() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let node_id = NodeId::new();

    // Shared cache + bus. Absent Redis: in-process backend, one node.
    let (cache, bus): (Arc<dyn SessionCache>, Arc<dyn EventBus>) = match &config.redis_url {
        Some(url) => {
            let backend = Arc::new(
                RedisBackend::connect(url)
                    .await
                    .context("shared cache connection failed")?,
            );
            (
                Arc::clone(&backend) as Arc<dyn SessionCache>,
                backend as Arc<dyn EventBus>,
            )
        }
        None => {
            warn!("REDISCLOUD_URL not set; running single-node with in-process bus");
            let backend = Arc::new(MemoryBackend::new());
            (
                Arc::clone(&backend) as Arc<dyn SessionCache>,
                backend as Arc<dyn EventBus>,
            )
        }
    };

    // Durable store. Absent Mongo: ephemeral in-memory tables.
    let (sessions, log): (Arc<dyn SessionRepository>, Arc<dyn UpdateLog>) =
        match &config.mongodb_uri {
            Some(uri) => {
                let store = Arc::new(
                    MongoStore::connect(uri)
                        .await
                        .context("durable store connection failed")?,
                );
                (
                    Arc::clone(&store) as Arc<dyn SessionRepository>,
                    store as Arc<dyn UpdateLog>,
                )
            }
            None => {
                warn!("MONGODB_URI not set; update log is in-memory and ephemeral");
                let store = Arc::new(MemoryStore::new());
                (
                    Arc::clone(&store) as Arc<dyn SessionRepository>,
                    store as Arc<dyn UpdateLog>,
                )
            }
        };

    // Owner registry. Absent RPC endpoint: nothing resolves, setup
    // fails closed.
    let registry: Arc<dyn OwnerRegistry> = match &config.rpc_url {
        Some(url) => Arc::new(
            RpcOwnerRegistry::new(url.clone()).context("registry client construction failed")?,
        ),
        None => {
            warn!("RPC_URL not set; owner lookups will resolve to nothing");
            Arc::new(StaticRegistry::new())
        }
    };

    let server_did = Did::new(config.server_did.clone());
    let verifier = TokenVerifier::new(
        server_did.clone(),
        Arc::new(EnvelopeVerifier::new()),
        Arc::new(OwnerResolver::new(registry)),
    );

    let manager = Arc::new(SessionManager::new(node_id, cache, bus, sessions, Arc::clone(&log)));
    let event_loop = manager.spawn_event_loop();
    let dispatcher = Dispatcher::new(verifier, Arc::clone(&manager), log);
    let hub = Hub::new(server_did, manager, dispatcher);

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!(
        addr = %config.bind_addr(),
        node = %node_id,
        cors_origins = ?config.cors_origins(),
        "chorusd listening"
    );

    let accept_loop = tokio::spawn(Arc::clone(&hub).run(listener));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    hub.shutdown().await;
    event_loop.abort();
    let _ = accept_loop.await;
    info!(open_connections = hub.connection_count(), "chorusd stopped");
    Ok(())
}
