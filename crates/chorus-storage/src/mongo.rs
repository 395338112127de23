//! MongoDB backend.
//!
//! Collections `sessions`, `document_updates` and `document_commits`,
//! with the index set the history queries and the terminate purge lean
//! on. Row ids are stored as strings so the wire, the cache and the
//! durable store all spell them identically.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use chorus_core::{
    DocumentCommit, DocumentId, DocumentUpdate, Session, SessionKey, SessionState,
};

use crate::error::{StoreError, StoreResult};
use crate::log::{DEFAULT_COMMIT_LIMIT, DEFAULT_UPDATE_LIMIT, LogQuery, SortOrder, UpdateLog};
use crate::sessions::SessionRepository;

const DEFAULT_DATABASE: &str = "chorus";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDoc {
    document_id: String,
    session_did: String,
    owner_did: String,
    #[serde(default)]
    room_info: Option<serde_json::Value>,
    state: SessionState,
    created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDoc {
    id: String,
    document_id: String,
    session_did: String,
    data: String,
    update_type: String,
    committed: bool,
    #[serde(default)]
    commit_cid: Option<String>,
    created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitDoc {
    id: String,
    document_id: String,
    session_did: String,
    cid: String,
    updates: Vec<String>,
    created_at: i64,
}

impl From<&DocumentUpdate> for UpdateDoc {
    fn from(u: &DocumentUpdate) -> Self {
        Self {
            id: u.id.to_string(),
            document_id: u.document_id.to_string(),
            session_did: u.session_did.to_string(),
            data: u.data.clone(),
            update_type: u.update_type.clone(),
            committed: u.committed,
            commit_cid: u.commit_cid.clone(),
            created_at: u.created_at,
        }
    }
}

impl TryFrom<UpdateDoc> for DocumentUpdate {
    type Error = StoreError;

    fn try_from(d: UpdateDoc) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&d.id)?,
            document_id: DocumentId::new(d.document_id),
            session_did: d.session_did.into(),
            data: d.data,
            update_type: d.update_type,
            committed: d.committed,
            commit_cid: d.commit_cid,
            created_at: d.created_at,
        })
    }
}

impl From<&DocumentCommit> for CommitDoc {
    fn from(c: &DocumentCommit) -> Self {
        Self {
            id: c.id.to_string(),
            document_id: c.document_id.to_string(),
            session_did: c.session_did.to_string(),
            cid: c.cid.clone(),
            updates: c.updates.iter().map(Uuid::to_string).collect(),
            created_at: c.created_at,
        }
    }
}

impl TryFrom<CommitDoc> for DocumentCommit {
    type Error = StoreError;

    fn try_from(d: CommitDoc) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&d.id)?,
            document_id: DocumentId::new(d.document_id),
            session_did: d.session_did.into(),
            cid: d.cid,
            updates: d
                .updates
                .iter()
                .map(|id| parse_uuid(id))
                .collect::<StoreResult<Vec<_>>>()?,
            created_at: d.created_at,
        })
    }
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("bad row id {s}: {e}")))
}

fn backend(e: mongodb::error::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        *e.kind,
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we))
            if we.code == 11000
    )
}

fn room_info_bson(room_info: Option<&serde_json::Value>) -> Bson {
    room_info
        .and_then(|v| mongodb::bson::to_bson(v).ok())
        .unwrap_or(Bson::Null)
}

fn sort_doc(sort: SortOrder) -> Document {
    let dir = match sort {
        SortOrder::Asc => 1,
        SortOrder::Desc => -1,
    };
    doc! { "createdAt": dir, "id": dir }
}

/// MongoDB-backed [`UpdateLog`] + [`SessionRepository`].
pub struct MongoStore {
    sessions: Collection<SessionDoc>,
    updates: Collection<UpdateDoc>,
    commits: Collection<CommitDoc>,
}

impl MongoStore {
    /// Connect to `uri` and ensure the index set exists.
    ///
    /// Uses the database named in the URI, or `chorus` when the URI
    /// names none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection or index
    /// bootstrap fails.
    pub async fn connect(uri: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(backend)?;
        let db = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));
        let store = Self::with_database(&db);
        store.ensure_indexes().await?;
        info!(database = %db.name(), "connected to durable store");
        Ok(store)
    }

    fn with_database(db: &Database) -> Self {
        Self {
            sessions: db.collection("sessions"),
            updates: db.collection("document_updates"),
            commits: db.collection("document_commits"),
        }
    }

    async fn ensure_indexes(&self) -> StoreResult<()> {
        let unique = |keys: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };
        let plain = |keys: Document| IndexModel::builder().keys(keys).build();

        self.sessions
            .create_index(unique(doc! { "documentId": 1, "sessionDid": 1 }))
            .await
            .map_err(backend)?;
        self.sessions
            .create_index(plain(doc! { "documentId": 1, "createdAt": 1, "sessionDid": 1 }))
            .await
            .map_err(backend)?;

        for keys in [
            doc! { "documentId": 1 },
            doc! { "committed": 1 },
            doc! { "createdAt": 1 },
            doc! { "documentId": 1, "committed": 1, "createdAt": 1, "sessionDid": 1 },
        ] {
            self.updates
                .create_index(plain(keys))
                .await
                .map_err(backend)?;
        }
        // Partial index over the uncommitted tail, the hot set for
        // late-joiner catch-up reads.
        self.updates
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "documentId": 1, "createdAt": 1 })
                    .options(
                        IndexOptions::builder()
                            .partial_filter_expression(doc! { "committed": false })
                            .build(),
                    )
                    .build(),
            )
            .await
            .map_err(backend)?;

        for keys in [
            doc! { "documentId": 1 },
            doc! { "createdAt": 1 },
            doc! { "documentId": 1, "createdAt": 1 },
        ] {
            self.commits
                .create_index(plain(keys))
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MongoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl UpdateLog for MongoStore {
    async fn create_update(&self, update: DocumentUpdate) -> StoreResult<DocumentUpdate> {
        if update.committed || update.commit_cid.is_some() {
            return Err(StoreError::InvalidUpdate(
                "new updates must be uncommitted".to_string(),
            ));
        }
        self.updates
            .insert_one(UpdateDoc::from(&update))
            .await
            .map_err(backend)?;
        Ok(update)
    }

    async fn create_commit(&self, commit: DocumentCommit) -> StoreResult<DocumentCommit> {
        let ids: Vec<String> = commit.updates.iter().map(Uuid::to_string).collect();
        self.commits
            .insert_one(CommitDoc::from(&commit))
            .await
            .map_err(backend)?;

        let result = self
            .updates
            .update_many(
                doc! { "documentId": commit.document_id.to_string(), "id": { "$in": &ids } },
                doc! { "$set": { "committed": true, "commitCid": &commit.cid } },
            )
            .await
            .map_err(backend)?;
        if result.matched_count < u64::try_from(ids.len()).unwrap_or(u64::MAX) {
            warn!(
                document_id = %commit.document_id,
                cid = %commit.cid,
                referenced = ids.len(),
                matched = result.matched_count,
                "commit references update ids with no stored row"
            );
        }
        Ok(commit)
    }

    async fn updates_by_document(
        &self,
        document_id: &DocumentId,
        query: &LogQuery,
    ) -> StoreResult<Vec<DocumentUpdate>> {
        let mut filter = doc! { "documentId": document_id.to_string() };
        if let Some(committed) = query.committed {
            filter.insert("committed", committed);
        }
        let limit = query.limit.unwrap_or(DEFAULT_UPDATE_LIMIT);
        let docs: Vec<UpdateDoc> = self
            .updates
            .find(filter)
            .sort(sort_doc(query.sort))
            .skip(u64::try_from(query.offset).unwrap_or(u64::MAX))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(backend)?
            .try_collect()
            .await
            .map_err(backend)?;
        docs.into_iter().map(DocumentUpdate::try_from).collect()
    }

    async fn commits_by_document(
        &self,
        document_id: &DocumentId,
        query: &LogQuery,
    ) -> StoreResult<Vec<DocumentCommit>> {
        let limit = query.limit.unwrap_or(DEFAULT_COMMIT_LIMIT);
        let docs: Vec<CommitDoc> = self
            .commits
            .find(doc! { "documentId": document_id.to_string() })
            .sort(sort_doc(query.sort))
            .skip(u64::try_from(query.offset).unwrap_or(u64::MAX))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(backend)?
            .try_collect()
            .await
            .map_err(backend)?;
        docs.into_iter().map(DocumentCommit::try_from).collect()
    }

    async fn delete_by_session(&self, key: &SessionKey) -> StoreResult<()> {
        let filter = doc! {
            "documentId": key.document_id.to_string(),
            "sessionDid": key.session_did.to_string(),
        };
        self.updates
            .delete_many(filter.clone())
            .await
            .map_err(backend)?;
        self.commits.delete_many(filter).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for MongoStore {
    async fn upsert_active(&self, session: &Session) -> StoreResult<()> {
        let filter = doc! {
            "documentId": session.document_id.to_string(),
            "sessionDid": session.session_did.to_string(),
            "state": { "$ne": "terminated" },
        };
        let update = doc! {
            "$set": {
                "state": "active",
                "roomInfo": room_info_bson(session.room_info.as_ref()),
            },
            "$setOnInsert": {
                "ownerDid": session.owner_did.to_string(),
                "createdAt": session.created_at,
            },
        };
        // A terminated row is excluded by the filter, so the upsert
        // tries to insert and trips the unique index instead of
        // reviving the pair.
        match self.sessions.update_one(filter, update).upsert(true).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => {
                Err(StoreError::SessionTerminated(session.key().to_string()))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn find(&self, key: &SessionKey) -> StoreResult<Option<Session>> {
        let row = self
            .sessions
            .find_one(doc! {
                "documentId": key.document_id.to_string(),
                "sessionDid": key.session_did.to_string(),
                "state": { "$ne": "terminated" },
            })
            .await
            .map_err(backend)?;
        Ok(row.map(|d| Session {
            document_id: DocumentId::new(d.document_id),
            session_did: d.session_did.into(),
            owner_did: d.owner_did.into(),
            room_info: d.room_info,
            clients: std::collections::BTreeSet::new(),
            state: d.state,
            created_at: d.created_at,
        }))
    }

    async fn set_state(&self, key: &SessionKey, state: SessionState) -> StoreResult<()> {
        let state_tag = state.to_string();
        self.sessions
            .update_one(
                doc! {
                    "documentId": key.document_id.to_string(),
                    "sessionDid": key.session_did.to_string(),
                },
                doc! { "$set": { "state": state_tag } },
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn set_room_info(
        &self,
        key: &SessionKey,
        room_info: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        self.sessions
            .update_one(
                doc! {
                    "documentId": key.document_id.to_string(),
                    "sessionDid": key.session_did.to_string(),
                },
                doc! { "$set": { "roomInfo": room_info_bson(room_info.as_ref()) } },
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn terminate(&self, key: &SessionKey) -> StoreResult<()> {
        self.sessions
            .update_one(
                doc! {
                    "documentId": key.document_id.to_string(),
                    "sessionDid": key.session_did.to_string(),
                },
                doc! { "$set": { "state": "terminated", "roomInfo": Bson::Null } },
            )
            .await
            .map_err(backend)?;
        Ok(())
    }
}
