//! The connection hub.
//!
//! Owns every open socket on this node. Frames from one socket are
//! handled strictly in order (receive-side FIFO); different sockets
//! proceed in parallel. All writes go through the per-socket mailbox so
//! sends never race and a slow consumer only ever hurts itself.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use chorus_core::{
    ClientId, Did, EventFrame, MembershipAction, Request, Response, SessionKey, status,
};
use chorus_sessions::SessionManager;

use crate::connection::{Connection, Outbound, PushOutcome};
use crate::dispatch::Dispatcher;

/// Ceiling on one request's total handling time, covering every
/// external call the handler makes.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// The WebSocket connection hub for one relay node.
pub struct Hub {
    server_did: Did,
    manager: Arc<SessionManager>,
    dispatcher: Dispatcher,
    connections: DashMap<ClientId, Arc<Connection>>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Build the hub and register its local-delivery callback with the
    /// session manager. One-way registration: the manager only ever
    /// calls back through the opaque handler.
    #[must_use]
    pub fn new(server_did: Did, manager: Arc<SessionManager>, dispatcher: Dispatcher) -> Arc<Self> {
        let hub = Arc::new(Self {
            server_did,
            manager: Arc::clone(&manager),
            dispatcher,
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        let weak = Arc::downgrade(&hub);
        manager.set_broadcast_handler(Arc::new(move |key, clients, exclude, payload| {
            if let Some(hub) = weak.upgrade() {
                hub.deliver(key, clients, exclude, payload);
            }
        }));
        hub
    }

    /// Number of open sockets on this node.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections until shutdown.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        info!(did = %self.server_did, "hub accepting connections");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move {
                            hub.handle_socket(stream, peer.to_string()).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        debug!("hub accept loop ended");
    }

    /// Stop accepting, then close every open socket.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in &self.connections {
            entry.value().mailbox.push(Outbound::Shutdown);
        }
    }

    /// Local fan-out: enqueue the pre-serialized frame on every named
    /// client that has a socket on this node. Clients connected
    /// elsewhere are ignored — their node replays the same bus event.
    fn deliver(
        &self,
        key: &SessionKey,
        clients: &[ClientId],
        exclude: Option<ClientId>,
        payload: &str,
    ) {
        let droppable = serde_json::from_str::<EventFrame>(payload)
            .map(|f| f.event_type.is_droppable())
            .unwrap_or(false);
        for client_id in clients {
            if exclude == Some(*client_id) {
                continue;
            }
            let Some(conn) = self.connections.get(client_id) else {
                continue; // connected to another node
            };
            match conn.mailbox.push(Outbound::Frame {
                payload: payload.to_string(),
                droppable,
            }) {
                PushOutcome::Queued => {}
                PushOutcome::Dropped => {
                    trace!(client = %client_id, "awareness frame dropped for slow consumer");
                }
                PushOutcome::Overflow => {
                    warn!(client = %client_id, session = %key, "send queue overflow, closing socket");
                    conn.mailbox.push(Outbound::Shutdown);
                }
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, peer: String) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = %peer, error = %e, "websocket upgrade failed");
                return;
            }
        };

        let conn = Arc::new(Connection::new(ClientId::new()));
        self.connections.insert(conn.client_id, Arc::clone(&conn));
        debug!(client = %conn.client_id, peer = %peer, "connection accepted");

        let (mut sink, mut frames) = ws.split();

        // Single writer per socket: drains the mailbox until Shutdown.
        let writer_conn = Arc::clone(&conn);
        let writer = tokio::spawn(async move {
            while let Some(item) = writer_conn.mailbox.pop().await {
                let result = match item {
                    Outbound::Frame { payload, .. } => sink.send(Message::Text(payload)).await,
                    Outbound::Pong(data) => sink.send(Message::Pong(data)).await,
                    Outbound::Shutdown => break,
                };
                if result.is_err() {
                    // Fatal write failure; the reader will observe the
                    // closed socket and run disconnection cleanup.
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        self.send_response(&conn, Response::handshake(&self.server_did));

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&conn, &text).await,
                    Some(Ok(Message::Ping(data))) => {
                        conn.mailbox.push(Outbound::Pong(data));
                    }
                    Some(Ok(Message::Binary(_))) => {
                        self.send_response(
                            &conn,
                            Response::error(None, status::BAD_REQUEST, "text frames only"),
                        );
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = %conn.client_id, error = %e, "socket error");
                        break;
                    }
                },
            }
        }

        self.disconnect(&conn).await;
        conn.mailbox.push(Outbound::Shutdown);
        let _ = writer.await;
        debug!(client = %conn.client_id, "connection closed");
    }

    /// Parse and dispatch one inbound frame, then reply. Runs inline in
    /// the socket's reader task, which is what guarantees per-socket
    /// FIFO handling.
    async fn handle_frame(&self, conn: &Arc<Connection>, text: &str) {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(client = %conn.client_id, error = %e, "malformed frame");
                self.send_response(
                    conn,
                    Response::error(None, status::BAD_REQUEST, "malformed frame"),
                );
                return;
            }
        };

        let seq_id = request.seq_id.clone();
        let cmd = request.cmd.clone();
        let outcome =
            tokio::time::timeout(REQUEST_DEADLINE, self.dispatcher.dispatch(conn, request)).await;
        let response = match outcome {
            Ok(Ok(data)) => Response::ok(seq_id, data),
            Ok(Err(e)) => {
                if e.status_code() == status::INTERNAL {
                    error!(client = %conn.client_id, cmd = %cmd, error = %e, "handler failed");
                } else {
                    debug!(client = %conn.client_id, cmd = %cmd, error = %e, "request rejected");
                }
                Response::error(seq_id, e.status_code(), e.public_message())
            }
            Err(_) => {
                error!(client = %conn.client_id, cmd = %cmd, "handler deadline exceeded");
                Response::error(seq_id, status::INTERNAL, "internal error")
            }
        };
        self.send_response(conn, response);
    }

    /// Enqueue a sequenced reply. Replies are never droppable.
    fn send_response(&self, conn: &Arc<Connection>, response: Response) {
        match serde_json::to_string(&response) {
            Ok(payload) => {
                if conn.mailbox.push(Outbound::Frame {
                    payload,
                    droppable: false,
                }) == PushOutcome::Overflow
                {
                    warn!(client = %conn.client_id, "send queue overflow on reply, closing socket");
                    conn.mailbox.push(Outbound::Shutdown);
                }
            }
            Err(e) => error!(error = %e, "unserializable response"),
        }
    }

    /// Disconnection cleanup: farewell broadcast (the leaver is
    /// excluded so it never sees its own goodbye), then membership
    /// removal, then the connection entry itself.
    async fn disconnect(&self, conn: &Arc<Connection>) {
        let state = conn.state.read().await.clone();
        if state.authenticated {
            if let Some(key) = state.session_key() {
                let frame = EventFrame::membership(
                    key.document_id.clone(),
                    MembershipAction::UserLeft,
                    conn.client_id,
                );
                match serde_json::to_string(&frame) {
                    Ok(payload) => {
                        self.manager
                            .broadcast_to_all_nodes(&key, &payload, Some(conn.client_id))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "unserializable farewell frame"),
                }
                if let Err(e) = self
                    .manager
                    .remove_client_from_session(&key, conn.client_id)
                    .await
                {
                    warn!(client = %conn.client_id, session = %key, error = %e, "membership cleanup failed");
                }
            }
        }
        self.connections.remove(&conn.client_id);
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("server_did", &self.server_did)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
