//! End-to-end flows over real WebSocket connections.
//!
//! Each test wires one or two hubs to a shared in-memory cache/bus and
//! store — two hubs on one bus model a two-node deployment — and drives
//! them with real clients.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chorus_capabilities::{
    CAN_COLLABORATE, CAN_CREATE, Capability, EnvelopeIssuer, EnvelopeVerifier, OwnerResolver,
    RESOURCE_COLLABORATION, SCHEME_STORAGE, StaticRegistry, TokenVerifier,
};
use chorus_core::{Did, DocumentId, NodeId, SessionState};
use chorus_events::{EventBus, MemoryBackend, SessionCache};
use chorus_gateway::{Dispatcher, Hub};
use chorus_sessions::SessionManager;
use chorus_storage::{LogQuery, MemoryStore, SessionRepository, UpdateLog};

const CONTRACT: &str = "0xAA";
const OWNER_ADDRESS: &str = "0xBB";

struct TestCluster {
    backend: Arc<MemoryBackend>,
    store: Arc<MemoryStore>,
    server_did: Did,
    owner: EnvelopeIssuer,
    session: EnvelopeIssuer,
}

impl TestCluster {
    fn new() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            store: Arc::new(MemoryStore::new()),
            server_did: Did::new("did:key:test-server"),
            owner: EnvelopeIssuer::generate(),
            session: EnvelopeIssuer::generate(),
        }
    }

    async fn spawn_node(&self) -> (Arc<Hub>, SocketAddr) {
        let registry = StaticRegistry::new().with_owner(CONTRACT, OWNER_ADDRESS, self.owner.did());
        let verifier = TokenVerifier::new(
            self.server_did.clone(),
            Arc::new(EnvelopeVerifier::new()),
            Arc::new(OwnerResolver::new(Arc::new(registry))),
        );
        let manager = Arc::new(SessionManager::new(
            NodeId::new(),
            Arc::clone(&self.backend) as Arc<dyn SessionCache>,
            Arc::clone(&self.backend) as Arc<dyn EventBus>,
            Arc::clone(&self.store) as Arc<dyn SessionRepository>,
            Arc::clone(&self.store) as Arc<dyn UpdateLog>,
        ));
        let _event_loop = manager.spawn_event_loop();
        let dispatcher = Dispatcher::new(verifier, Arc::clone(&manager), Arc::clone(&self.store) as Arc<dyn UpdateLog>);
        let hub = Hub::new(self.server_did.clone(), manager, dispatcher);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&hub).run(listener));
        (hub, addr)
    }

    fn owner_token(&self) -> String {
        self.owner.issue(
            &self.server_did,
            Capability::new(SCHEME_STORAGE, CONTRACT.to_lowercase(), CAN_CREATE),
            None,
        )
    }

    fn collab_token(&self) -> String {
        self.session.issue(
            &self.server_did,
            Capability::new(SCHEME_STORAGE, RESOURCE_COLLABORATION, CAN_COLLABORATE),
            None,
        )
    }

    fn session_did(&self) -> String {
        self.session.did().to_string()
    }

    fn owner_auth_args(&self) -> Value {
        json!({
            "documentId": "d1",
            "sessionDid": self.session_did(),
            "ownerToken": self.owner_token(),
            "contractAddress": CONTRACT,
            "ownerAddress": OWNER_ADDRESS,
        })
    }

    fn editor_auth_args(&self) -> Value {
        json!({
            "documentId": "d1",
            "sessionDid": self.session_did(),
            "collaborationToken": self.collab_token(),
        })
    }
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    seq: u64,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        let mut client = Self { ws, seq: 0 };
        let handshake = client.next_json().await;
        assert_eq!(handshake["is_handshake_response"], true);
        assert_eq!(handshake["data"]["server_did"], "did:key:test-server");
        client
    }

    async fn next_json(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Send a command and wait for its sequenced reply, skipping any
    /// event frames that arrive in between.
    async fn request(&mut self, cmd: &str, args: Value) -> Value {
        self.seq += 1;
        let seq_id = self.seq.to_string();
        let frame = json!({ "cmd": cmd, "args": args, "seqId": seq_id }).to_string();
        self.ws.send(Message::Text(frame)).await.unwrap();
        loop {
            let reply = self.next_json().await;
            if reply["seqId"] == seq_id.as_str() {
                return reply;
            }
        }
    }

    /// Wait for the next unsolicited event frame of the given kind.
    async fn next_event(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_json().await;
            if frame["type"] == "event" && frame["event_type"] == kind {
                return frame;
            }
        }
    }

    /// Assert that no frame of the given event kind arrives within a
    /// short window.
    async fn expect_silence(&mut self, kind: &str) {
        let waited =
            tokio::time::timeout(Duration::from_millis(300), self.next_event(kind)).await;
        assert!(waited.is_err(), "unexpected {kind} event");
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn single_node_happy_path() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    // Owner bootstraps the session.
    let mut owner = Client::connect(addr).await;
    let reply = owner.request("/auth", cluster.owner_auth_args()).await;
    assert_eq!(reply["statusCode"], 200, "auth reply: {reply}");
    assert_eq!(reply["data"]["role"], "owner");
    assert_eq!(reply["data"]["sessionType"], "new");

    // Editor joins.
    let mut editor = Client::connect(addr).await;
    let reply = editor.request("/auth", cluster.editor_auth_args()).await;
    assert_eq!(reply["statusCode"], 200, "join reply: {reply}");
    assert_eq!(reply["data"]["role"], "editor");
    assert_eq!(reply["data"]["sessionType"], "existing");

    // Owner pushes an update; the editor sees it, the owner gets the row.
    let reply = owner
        .request(
            "/documents/update",
            json!({
                "documentId": "d1",
                "data": "payload1",
                "collaborationToken": cluster.collab_token(),
            }),
        )
        .await;
    assert_eq!(reply["statusCode"], 200, "update reply: {reply}");
    let update_id = reply["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(reply["data"]["committed"], false);

    let event = editor.next_event("CONTENT_UPDATE").await;
    assert_eq!(event["event"]["data"]["data"], "payload1");
    assert_eq!(event["event"]["data"]["id"], update_id.as_str());
    assert_eq!(event["event"]["roomId"], "d1");

    let rows = cluster
        .store
        .updates_by_document(&DocumentId::new("d1"), &LogQuery::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].committed);
}

#[tokio::test]
async fn owner_commit_marks_updates() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;
    let mut editor = Client::connect(addr).await;
    editor.request("/auth", cluster.editor_auth_args()).await;

    let reply = owner
        .request(
            "/documents/update",
            json!({
                "documentId": "d1",
                "data": "payload1",
                "collaborationToken": cluster.collab_token(),
            }),
        )
        .await;
    let update_id = reply["data"]["id"].as_str().unwrap().to_string();
    // Drain the update's own fan-out before watching for silence below.
    editor.next_event("CONTENT_UPDATE").await;

    let reply = owner
        .request(
            "/documents/commit",
            json!({
                "documentId": "d1",
                "updates": [update_id],
                "cid": "bafy...X",
                "ownerToken": cluster.owner_token(),
                "contractAddress": CONTRACT,
                "ownerAddress": OWNER_ADDRESS,
            }),
        )
        .await;
    assert_eq!(reply["statusCode"], 200, "commit reply: {reply}");
    assert_eq!(reply["data"]["cid"], "bafy...X");

    let rows = cluster
        .store
        .updates_by_document(&DocumentId::new("d1"), &LogQuery::default())
        .await
        .unwrap();
    assert!(rows[0].committed);
    assert_eq!(rows[0].commit_cid.as_deref(), Some("bafy...X"));

    // Commits are owner-private: no broadcast reaches the editor.
    editor.expect_silence("CONTENT_UPDATE").await;
}

#[tokio::test]
async fn editor_cannot_commit() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;
    let mut editor = Client::connect(addr).await;
    editor.request("/auth", cluster.editor_auth_args()).await;

    let reply = editor
        .request(
            "/documents/commit",
            json!({
                "documentId": "d1",
                "updates": [],
                "cid": "bafy...X",
                "ownerToken": cluster.collab_token(),
                "contractAddress": CONTRACT,
                "ownerAddress": OWNER_ADDRESS,
            }),
        )
        .await;
    assert_eq!(reply["statusCode"], 403);
}

#[tokio::test]
async fn cross_node_awareness_fanout() {
    let cluster = TestCluster::new();
    let (_hub1, addr1) = cluster.spawn_node().await;
    let (_hub2, addr2) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr1).await;
    owner.request("/auth", cluster.owner_auth_args()).await;

    let mut editor = Client::connect(addr2).await;
    let reply = editor.request("/auth", cluster.editor_auth_args()).await;
    assert_eq!(reply["statusCode"], 200, "cross-node join: {reply}");
    settle().await;

    let reply = owner
        .request(
            "/documents/awareness",
            json!({ "documentId": "d1", "data": { "cursor": 7 } }),
        )
        .await;
    assert_eq!(reply["statusCode"], 200);

    let event = editor.next_event("AWARENESS_UPDATE").await;
    assert_eq!(event["event"]["data"]["cursor"], 7);
    assert_eq!(event["event"]["roomId"], "d1");

    // Awareness is never persisted.
    assert_eq!(cluster.store.update_count().await, 0);
    assert_eq!(cluster.store.commit_count().await, 0);
}

#[tokio::test]
async fn cross_node_membership_and_peers() {
    let cluster = TestCluster::new();
    let (_hub1, addr1) = cluster.spawn_node().await;
    let (_hub2, addr2) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr1).await;
    owner.request("/auth", cluster.owner_auth_args()).await;

    let mut editor = Client::connect(addr2).await;
    editor.request("/auth", cluster.editor_auth_args()).await;

    // The owner on node 1 sees the join that happened on node 2.
    let event = owner.next_event("ROOM_MEMBERSHIP_CHANGE").await;
    assert_eq!(event["event"]["data"]["action"], "user_joined");

    let reply = owner
        .request("/documents/peers/list", json!({ "documentId": "d1" }))
        .await;
    assert_eq!(reply["data"]["peers"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn termination_retires_session_and_purges_log() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;
    let mut editor = Client::connect(addr).await;
    editor.request("/auth", cluster.editor_auth_args()).await;

    owner
        .request(
            "/documents/update",
            json!({
                "documentId": "d1",
                "data": "payload1",
                "collaborationToken": cluster.collab_token(),
            }),
        )
        .await;
    assert_eq!(cluster.store.update_count().await, 1);

    let reply = owner
        .request(
            "/documents/terminate",
            json!({
                "documentId": "d1",
                "sessionDid": cluster.session_did(),
                "ownerToken": cluster.owner_token(),
                "contractAddress": CONTRACT,
                "ownerAddress": OWNER_ADDRESS,
            }),
        )
        .await;
    assert_eq!(reply["statusCode"], 200, "terminate reply: {reply}");

    // Every other client hears the termination.
    let event = editor.next_event("SESSION_TERMINATED").await;
    assert_eq!(event["event"]["roomId"], "d1");

    // Log purged, pair retired.
    assert_eq!(cluster.store.update_count().await, 0);
    assert_eq!(cluster.store.commit_count().await, 0);

    // A fresh owner /auth on the retired pair fails: terminated pairs
    // are invisible and never revived.
    let mut late = Client::connect(addr).await;
    let reply = late.request("/auth", cluster.owner_auth_args()).await;
    assert_eq!(reply["statusCode"], 404, "late auth: {reply}");
}

#[tokio::test]
async fn unauthorized_terminate_is_rejected() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;
    let mut editor = Client::connect(addr).await;
    editor.request("/auth", cluster.editor_auth_args()).await;

    // The editor's collaboration token is not an owner token.
    let reply = editor
        .request(
            "/documents/terminate",
            json!({
                "documentId": "d1",
                "sessionDid": cluster.session_did(),
                "ownerToken": cluster.collab_token(),
                "contractAddress": CONTRACT,
                "ownerAddress": OWNER_ADDRESS,
            }),
        )
        .await;
    assert_eq!(reply["statusCode"], 401);

    // Session unchanged.
    let key = chorus_core::SessionKey::new(
        DocumentId::new("d1"),
        Did::new(cluster.session_did()),
    );
    let row = cluster.store.find(&key).await.unwrap().unwrap();
    assert_eq!(row.state, SessionState::Active);
}

#[tokio::test]
async fn idle_disconnect_deactivates_and_owner_revives() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;

    let key = chorus_core::SessionKey::new(
        DocumentId::new("d1"),
        Did::new(cluster.session_did()),
    );
    owner.close().await;
    settle().await;

    // Cluster-wide client set empty: cache key gone, durable row idle.
    assert!(cluster.backend.get(&key).await.unwrap().is_none());
    let row = cluster.store.find(&key).await.unwrap().unwrap();
    assert_eq!(row.state, SessionState::Inactive);

    // Owner re-setup revives the pair with the stored owner.
    let mut revived = Client::connect(addr).await;
    let reply = revived.request("/auth", cluster.owner_auth_args()).await;
    assert_eq!(reply["statusCode"], 200, "revive reply: {reply}");
    assert_eq!(reply["data"]["role"], "owner");
    assert_eq!(reply["data"]["sessionType"], "existing");

    let row = cluster.store.find(&key).await.unwrap().unwrap();
    assert_eq!(row.state, SessionState::Active);
    assert_eq!(row.owner_did, cluster.owner.did());
}

#[tokio::test]
async fn disconnect_announces_user_left() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;
    let mut editor = Client::connect(addr).await;
    editor.request("/auth", cluster.editor_auth_args()).await;

    editor.close().await;

    let event = owner.next_event("ROOM_MEMBERSHIP_CHANGE").await;
    // First membership event the owner sees is the editor's join...
    assert_eq!(event["event"]["data"]["action"], "user_joined");
    // ...followed by its departure.
    let event = owner.next_event("ROOM_MEMBERSHIP_CHANGE").await;
    assert_eq!(event["event"]["data"]["action"], "user_left");
}

#[tokio::test]
async fn protocol_errors_keep_socket_open() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut client = Client::connect(addr).await;

    // Malformed frame: sequenced 400, socket stays open.
    client
        .ws
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    let reply = client.next_json().await;
    assert_eq!(reply["statusCode"], 400);
    assert!(reply["seqId"].is_null());

    // Unknown command: 404.
    let reply = client.request("/nonsense", json!({})).await;
    assert_eq!(reply["statusCode"], 404);

    // Unauthenticated update: 401.
    let reply = client
        .request(
            "/documents/update",
            json!({
                "documentId": "d1",
                "data": "p",
                "collaborationToken": "x",
            }),
        )
        .await;
    assert_eq!(reply["statusCode"], 401);

    // The socket survived all of the above.
    let reply = client.request("/nonsense", json!({})).await;
    assert_eq!(reply["statusCode"], 404);
}

#[tokio::test]
async fn join_with_bad_collaboration_token_fails() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;

    // Token rooted at the wrong DID.
    let imposter = EnvelopeIssuer::generate();
    let bad_token = imposter.issue(
        &cluster.server_did,
        Capability::new(SCHEME_STORAGE, RESOURCE_COLLABORATION, CAN_COLLABORATE),
        None,
    );
    let mut editor = Client::connect(addr).await;
    let reply = editor
        .request(
            "/auth",
            json!({
                "documentId": "d1",
                "sessionDid": cluster.session_did(),
                "collaborationToken": bad_token,
            }),
        )
        .await;
    assert_eq!(reply["statusCode"], 401);
}

#[tokio::test]
async fn update_history_pages_and_filters() {
    let cluster = TestCluster::new();
    let (_hub, addr) = cluster.spawn_node().await;

    let mut owner = Client::connect(addr).await;
    owner.request("/auth", cluster.owner_auth_args()).await;

    for i in 0..3 {
        let reply = owner
            .request(
                "/documents/update",
                json!({
                    "documentId": "d1",
                    "data": format!("payload{i}"),
                    "collaborationToken": cluster.collab_token(),
                }),
            )
            .await;
        assert_eq!(reply["statusCode"], 200);
    }

    let reply = owner
        .request(
            "/documents/update/history",
            json!({ "documentId": "d1", "limit": 2 }),
        )
        .await;
    let updates = reply["data"]["updates"].as_array().unwrap();
    assert_eq!(updates.len(), 2);

    let reply = owner
        .request(
            "/documents/update/history",
            json!({ "documentId": "d1", "filters": { "committed": true } }),
        )
        .await;
    assert_eq!(reply["data"]["updates"].as_array().unwrap().len(), 0);

    let reply = owner
        .request("/documents/commit/history", json!({ "documentId": "d1" }))
        .await;
    assert_eq!(reply["data"]["commits"].as_array().unwrap().len(), 0);
}
