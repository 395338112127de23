//! Command dispatch - the eight wire commands.
//!
//! Each handler states its preconditions up front, performs its
//! effects, and returns the reply payload; the hub wraps that in the
//! response envelope. Broadcast publication is spawned so it never
//! blocks the success reply to the originating client; the one
//! exception is `/documents/terminate`, whose farewell frame must reach
//! the local client set before the session mirror is wiped.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use chorus_capabilities::TokenVerifier;
use chorus_core::{
    ClientId, Did, DocumentCommit, DocumentId, DocumentUpdate, EventFrame, EventKind,
    MembershipAction, Request, Role, SessionKey, SessionState, commands,
};
use chorus_sessions::SessionManager;
use chorus_storage::{LogQuery, SortOrder, UpdateLog};

use crate::connection::{Connection, ConnectionState};
use crate::error::DispatchError;

type DispatchResult = Result<serde_json::Value, DispatchError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthArgs {
    document_id: String,
    session_did: String,
    collaboration_token: Option<String>,
    owner_token: Option<String>,
    contract_address: Option<String>,
    owner_address: Option<String>,
    room_info: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArgs {
    document_id: String,
    data: String,
    collaboration_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitArgs {
    document_id: String,
    updates: Vec<Uuid>,
    cid: String,
    owner_token: String,
    contract_address: String,
    owner_address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryFilters {
    committed: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryArgs {
    document_id: String,
    offset: Option<usize>,
    limit: Option<usize>,
    sort: Option<String>,
    #[serde(default)]
    filters: HistoryFilters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeersArgs {
    document_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AwarenessArgs {
    document_id: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateArgs {
    document_id: String,
    session_did: String,
    owner_token: String,
    contract_address: String,
    owner_address: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> Result<T, DispatchError> {
    serde_json::from_value(args).map_err(|e| DispatchError::BadRequest(format!("bad args: {e}")))
}

/// Request/response handlers bridging the hub to verification, session
/// state and the update log.
pub struct Dispatcher {
    verifier: TokenVerifier,
    manager: Arc<SessionManager>,
    log: Arc<dyn UpdateLog>,
}

impl Dispatcher {
    /// Wire a dispatcher to its collaborators.
    #[must_use]
    pub fn new(
        verifier: TokenVerifier,
        manager: Arc<SessionManager>,
        log: Arc<dyn UpdateLog>,
    ) -> Self {
        Self {
            verifier,
            manager,
            log,
        }
    }

    /// Route one request frame to its handler.
    pub(crate) async fn dispatch(&self, conn: &Arc<Connection>, request: Request) -> DispatchResult {
        match request.cmd.as_str() {
            commands::AUTH => self.auth(conn, request.args).await,
            commands::DOCUMENT_UPDATE => self.document_update(conn, request.args).await,
            commands::DOCUMENT_COMMIT => self.document_commit(conn, request.args).await,
            commands::UPDATE_HISTORY => self.update_history(conn, request.args).await,
            commands::COMMIT_HISTORY => self.commit_history(conn, request.args).await,
            commands::PEERS_LIST => self.peers_list(conn, request.args).await,
            commands::AWARENESS => self.awareness(conn, request.args).await,
            commands::TERMINATE => self.terminate(conn, request.args).await,
            unknown => Err(DispatchError::NotFound(format!(
                "no such command: {unknown}"
            ))),
        }
    }

    /// `/auth` — setup a fresh (or idle) session as owner, or join an
    /// active one with a collaboration token. Role is recomputed on
    /// every call.
    async fn auth(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: AuthArgs = parse_args(args)?;
        let key = SessionKey::new(
            DocumentId::new(args.document_id.clone()),
            Did::new(args.session_did.clone()),
        );

        let existing = self.manager.get_session(&key).await?;
        let pre_existing = existing.is_some();

        let (session, role) = match existing {
            Some(session) if session.state == SessionState::Active => {
                // Join path.
                let token = args.collaboration_token.as_deref().ok_or_else(|| {
                    DispatchError::Unauthorized("collaboration token required".to_string())
                })?;
                if !self
                    .verifier
                    .verify_collaboration_token(token, &session.session_did)
                    .await
                {
                    return Err(DispatchError::Unauthorized(
                        "invalid collaboration token".to_string(),
                    ));
                }

                let mut role = Role::Editor;
                if let (Some(owner_token), Some(contract), Some(owner_addr)) = (
                    args.owner_token.as_deref(),
                    args.contract_address.as_deref(),
                    args.owner_address.as_deref(),
                ) {
                    let verified = self
                        .verifier
                        .verify_owner_token(owner_token, contract, owner_addr)
                        .await;
                    if verified.as_ref() == Some(&session.owner_did) {
                        role = Role::Owner;
                    }
                }

                let session = if role == Role::Owner && args.room_info.is_some() {
                    self.manager
                        .update_room_info(&key, args.room_info.clone())
                        .await?;
                    let mut updated = session;
                    updated.room_info = args.room_info;
                    updated
                } else {
                    session
                };
                (session, role)
            }
            _ => {
                // Setup path: fresh pair, or owner re-setup of an idle one.
                let (owner_token, contract, owner_addr) = match (
                    args.owner_token.as_deref(),
                    args.contract_address.as_deref(),
                    args.owner_address.as_deref(),
                ) {
                    (Some(t), Some(c), Some(a)) => (t, c, a),
                    _ => {
                        return Err(DispatchError::Unauthorized(
                            "owner token required for session setup".to_string(),
                        ));
                    }
                };
                let owner_did = self
                    .verifier
                    .verify_owner_token(owner_token, contract, owner_addr)
                    .await
                    .ok_or_else(|| {
                        DispatchError::Unauthorized("owner verification failed".to_string())
                    })?;

                let session = self
                    .manager
                    .create_session(
                        key.document_id.clone(),
                        key.session_did.clone(),
                        owner_did,
                        args.room_info,
                    )
                    .await?;
                (session, Role::Owner)
            }
        };

        self.manager
            .add_client_to_session(&key, conn.client_id)
            .await?;
        {
            let mut state = conn.state.write().await;
            *state = ConnectionState {
                authenticated: true,
                document_id: Some(key.document_id.clone()),
                session_did: Some(key.session_did.clone()),
                role: Some(role),
            };
        }

        self.spawn_broadcast(
            &key,
            EventFrame::membership(
                key.document_id.clone(),
                MembershipAction::UserJoined,
                conn.client_id,
            ),
            Some(conn.client_id),
        );

        Ok(serde_json::json!({
            "role": role,
            "sessionType": if pre_existing { "existing" } else { "new" },
            "roomInfo": session.room_info,
        }))
    }

    /// `/documents/update` — persist an opaque update row and fan it
    /// out to the session's other clients.
    async fn document_update(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: UpdateArgs = parse_args(args)?;
        let (key, _) = self.authorized_session(conn, &args.document_id).await?;
        if !self
            .verifier
            .verify_collaboration_token(&args.collaboration_token, &key.session_did)
            .await
        {
            return Err(DispatchError::Unauthorized(
                "invalid collaboration token".to_string(),
            ));
        }

        let update = DocumentUpdate::new(
            key.document_id.clone(),
            key.session_did.clone(),
            args.data,
        );
        let update = self.log.create_update(update).await?;

        self.spawn_broadcast(
            &key,
            EventFrame::new(
                EventKind::ContentUpdate,
                key.document_id.clone(),
                serde_json::json!({
                    "id": update.id,
                    "data": update.data,
                    "createdAt": update.created_at,
                }),
            ),
            Some(conn.client_id),
        );

        serde_json::to_value(&update).map_err(|e| DispatchError::Internal(e.to_string()))
    }

    /// `/documents/commit` — owner-only; anchors update rows to an
    /// external snapshot. No broadcast: peers observe commits through
    /// the content-addressed snapshot itself.
    async fn document_commit(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: CommitArgs = parse_args(args)?;
        let (key, role) = self.authorized_session(conn, &args.document_id).await?;
        if role != Role::Owner {
            return Err(DispatchError::Forbidden("owner role required".to_string()));
        }
        // Owner token is re-verified on every commit, not trusted from
        // the role derived at /auth time.
        if self
            .verifier
            .verify_owner_token(&args.owner_token, &args.contract_address, &args.owner_address)
            .await
            .is_none()
        {
            return Err(DispatchError::Unauthorized(
                "owner verification failed".to_string(),
            ));
        }

        let commit = DocumentCommit::new(
            key.document_id.clone(),
            key.session_did.clone(),
            args.cid,
            args.updates,
        );
        let commit = self.log.create_commit(commit).await?;
        serde_json::to_value(&commit).map_err(|e| DispatchError::Internal(e.to_string()))
    }

    /// `/documents/update/history` — page through the update log.
    async fn update_history(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: HistoryArgs = parse_args(args)?;
        let (key, _) = self.authorized_session(conn, &args.document_id).await?;
        let query = LogQuery {
            offset: args.offset.unwrap_or(0),
            limit: args.limit,
            sort: SortOrder::parse(args.sort.as_deref()),
            committed: args.filters.committed,
        };
        let updates = self.log.updates_by_document(&key.document_id, &query).await?;
        Ok(serde_json::json!({ "updates": updates }))
    }

    /// `/documents/commit/history` — page through the commit log.
    async fn commit_history(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: HistoryArgs = parse_args(args)?;
        let (key, _) = self.authorized_session(conn, &args.document_id).await?;
        let query = LogQuery {
            offset: args.offset.unwrap_or(0),
            limit: args.limit,
            sort: SortOrder::parse(args.sort.as_deref()),
            committed: None,
        };
        let commits = self.log.commits_by_document(&key.document_id, &query).await?;
        Ok(serde_json::json!({ "commits": commits }))
    }

    /// `/documents/peers/list` — the cluster-wide client set.
    async fn peers_list(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: PeersArgs = parse_args(args)?;
        let (key, _) = self.authorized_session(conn, &args.document_id).await?;
        let peers = self.manager.peers(&key).await;
        Ok(serde_json::json!({ "peers": peers }))
    }

    /// `/documents/awareness` — ephemeral presence fan-out; nothing is
    /// persisted.
    async fn awareness(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: AwarenessArgs = parse_args(args)?;
        let (key, _) = self.authorized_session(conn, &args.document_id).await?;
        self.spawn_broadcast(
            &key,
            EventFrame::new(EventKind::AwarenessUpdate, key.document_id.clone(), args.data),
            Some(conn.client_id),
        );
        Ok(serde_json::json!({}))
    }

    /// `/documents/terminate` — verify the owner, tell every client,
    /// retire the pair, purge its log.
    async fn terminate(&self, conn: &Arc<Connection>, args: serde_json::Value) -> DispatchResult {
        let args: TerminateArgs = parse_args(args)?;
        let key = SessionKey::new(
            DocumentId::new(args.document_id),
            Did::new(args.session_did),
        );
        let session = self
            .manager
            .get_session(&key)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("no such session: {key}")))?;

        let verified = self
            .verifier
            .verify_owner_token(&args.owner_token, &args.contract_address, &args.owner_address)
            .await
            .ok_or_else(|| {
                DispatchError::Unauthorized("owner verification failed".to_string())
            })?;
        if verified != session.owner_did {
            return Err(DispatchError::Unauthorized(
                "token owner does not match session owner".to_string(),
            ));
        }

        // Farewell must reach local clients before the mirror is wiped,
        // so this broadcast is awaited, not spawned.
        let frame = EventFrame::new(
            EventKind::SessionTerminated,
            key.document_id.clone(),
            serde_json::json!({ "sessionDid": key.session_did }),
        );
        match serde_json::to_string(&frame) {
            Ok(payload) => {
                self.manager
                    .broadcast_to_all_nodes(&key, &payload, Some(conn.client_id))
                    .await;
            }
            Err(e) => warn!(error = %e, "unserializable termination frame"),
        }

        self.manager.terminate_session(&key).await?;
        Ok(serde_json::json!({ "terminated": true }))
    }

    /// Common precondition of every post-auth command: the socket is
    /// authenticated and the request names the document it
    /// authenticated into.
    async fn authorized_session(
        &self,
        conn: &Arc<Connection>,
        document_id: &str,
    ) -> Result<(SessionKey, Role), DispatchError> {
        let state = conn.state.read().await.clone();
        if !state.authenticated {
            return Err(DispatchError::Unauthorized(
                "authentication required".to_string(),
            ));
        }
        let key = state.session_key().ok_or_else(|| {
            DispatchError::Unauthorized("authentication required".to_string())
        })?;
        if key.document_id.as_str() != document_id {
            return Err(DispatchError::Unauthorized(
                "socket is not authorized for this document".to_string(),
            ));
        }
        let role = state.role.unwrap_or(Role::Editor);
        Ok((key, role))
    }

    /// Fan a frame out without blocking the caller's reply.
    fn spawn_broadcast(&self, key: &SessionKey, frame: EventFrame, exclude: Option<ClientId>) {
        let manager = Arc::clone(&self.manager);
        let key = key.clone();
        tokio::spawn(async move {
            match serde_json::to_string(&frame) {
                Ok(payload) => {
                    manager.broadcast_to_all_nodes(&key, &payload, exclude).await;
                }
                Err(e) => warn!(error = %e, "unserializable event frame"),
            }
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
