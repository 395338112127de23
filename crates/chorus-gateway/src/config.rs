//! Environment-driven configuration.
//!
//! Every knob is an environment variable (the deployment platform sets
//! them); the matching flags exist for local runs. Backends degrade
//! gracefully: without `MONGODB_URI` the relay keeps its log in memory,
//! without `REDISCLOUD_URL` it runs single-node on an in-process bus,
//! without `RPC_URL` owner lookups resolve to nothing and every setup
//! fails closed.

use clap::Parser;

/// Configuration for one relay node.
#[derive(Debug, Clone, Parser)]
#[command(name = "chorusd", version, about = "Chorus collaboration relay node")]
pub struct GatewayConfig {
    /// Bind address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Deployment environment; `production` selects JSON logs.
    #[arg(long = "node-env", env = "NODE_ENV", default_value = "development")]
    pub node_env: String,

    /// Comma-separated allowed origins, consumed by the fronting proxy
    /// layer; logged at startup for operator visibility.
    #[arg(long = "cors-origins", env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    /// This server's DID — the audience every capability token must be
    /// addressed to.
    #[arg(long = "server-did", env = "SERVER_DID")]
    pub server_did: String,

    /// Durable store connection string. Absent: in-memory store
    /// (single-process, ephemeral).
    #[arg(long = "mongodb-uri", env = "MONGODB_URI")]
    pub mongodb_uri: Option<String>,

    /// Shared cache + bus connection string. Absent: in-process backend
    /// (single-node).
    #[arg(long = "redis-url", env = "REDISCLOUD_URL")]
    pub redis_url: Option<String>,

    /// Owner registry JSON-RPC endpoint. Absent: no owner resolves and
    /// session setup always fails.
    #[arg(long = "rpc-url", env = "RPC_URL")]
    pub rpc_url: Option<String>,

    /// Tokio worker threads. Absent: one per core.
    #[arg(long = "web-concurrency", env = "WEB_CONCURRENCY")]
    pub web_concurrency: Option<usize>,
}

impl GatewayConfig {
    /// The `host:port` string to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this node runs in production mode.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.node_env.eq_ignore_ascii_case("production")
    }

    /// Parsed CORS origin list.
    #[must_use]
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
