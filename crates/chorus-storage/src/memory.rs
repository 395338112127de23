//! In-memory backend.
//!
//! Backs the test suite and single-process deployments that run without
//! a configured `MONGODB_URI`. All three tables live behind one lock so
//! the commit transition is strictly atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use chorus_core::{
    DocumentCommit, DocumentId, DocumentUpdate, Session, SessionKey, SessionState,
};

use crate::error::{StoreError, StoreResult};
use crate::log::{DEFAULT_COMMIT_LIMIT, DEFAULT_UPDATE_LIMIT, LogQuery, SortOrder, UpdateLog};
use crate::sessions::SessionRepository;

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionKey, Session>,
    updates: Vec<DocumentUpdate>,
    commits: Vec<DocumentCommit>,
}

/// In-memory [`UpdateLog`] + [`SessionRepository`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of update rows, across all documents. Test hook.
    pub async fn update_count(&self) -> usize {
        self.tables.read().await.updates.len()
    }

    /// Total number of commit rows, across all documents. Test hook.
    pub async fn commit_count(&self) -> usize {
        self.tables.read().await.commits.len()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

fn page<T: Clone>(
    mut rows: Vec<T>,
    query: &LogQuery,
    default_limit: usize,
    key: impl Fn(&T) -> (i64, Uuid),
) -> Vec<T> {
    rows.sort_by_key(&key);
    if query.sort == SortOrder::Desc {
        rows.reverse();
    }
    let limit = query.limit.unwrap_or(default_limit);
    rows.into_iter().skip(query.offset).take(limit).collect()
}

#[async_trait]
impl UpdateLog for MemoryStore {
    async fn create_update(&self, update: DocumentUpdate) -> StoreResult<DocumentUpdate> {
        if update.committed || update.commit_cid.is_some() {
            return Err(StoreError::InvalidUpdate(
                "new updates must be uncommitted".to_string(),
            ));
        }
        let mut tables = self.tables.write().await;
        tables.updates.push(update.clone());
        Ok(update)
    }

    async fn create_commit(&self, commit: DocumentCommit) -> StoreResult<DocumentCommit> {
        let mut tables = self.tables.write().await;

        let mut missing: Vec<Uuid> = commit.updates.clone();
        for row in &mut tables.updates {
            if row.document_id == commit.document_id && commit.updates.contains(&row.id) {
                row.committed = true;
                row.commit_cid = Some(commit.cid.clone());
                missing.retain(|id| *id != row.id);
            }
        }
        if !missing.is_empty() {
            warn!(
                document_id = %commit.document_id,
                cid = %commit.cid,
                unknown = missing.len(),
                "commit references update ids with no stored row"
            );
        }
        tables.commits.push(commit.clone());
        Ok(commit)
    }

    async fn updates_by_document(
        &self,
        document_id: &DocumentId,
        query: &LogQuery,
    ) -> StoreResult<Vec<DocumentUpdate>> {
        let tables = self.tables.read().await;
        let rows: Vec<DocumentUpdate> = tables
            .updates
            .iter()
            .filter(|u| u.document_id == *document_id)
            .filter(|u| query.committed.is_none_or(|c| u.committed == c))
            .cloned()
            .collect();
        Ok(page(rows, query, DEFAULT_UPDATE_LIMIT, |u| {
            (u.created_at, u.id)
        }))
    }

    async fn commits_by_document(
        &self,
        document_id: &DocumentId,
        query: &LogQuery,
    ) -> StoreResult<Vec<DocumentCommit>> {
        let tables = self.tables.read().await;
        let rows: Vec<DocumentCommit> = tables
            .commits
            .iter()
            .filter(|c| c.document_id == *document_id)
            .cloned()
            .collect();
        Ok(page(rows, query, DEFAULT_COMMIT_LIMIT, |c| {
            (c.created_at, c.id)
        }))
    }

    async fn delete_by_session(&self, key: &SessionKey) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .updates
            .retain(|u| u.document_id != key.document_id || u.session_did != key.session_did);
        tables
            .commits
            .retain(|c| c.document_id != key.document_id || c.session_did != key.session_did);
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn upsert_active(&self, session: &Session) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let key = session.key();
        match tables.sessions.get_mut(&key) {
            Some(row) if row.state == SessionState::Terminated => {
                Err(StoreError::SessionTerminated(key.to_string()))
            }
            Some(row) => {
                // Re-setup of an existing pair: flip back to Active,
                // keep the original owner and creation time.
                row.state = SessionState::Active;
                row.room_info = session.room_info.clone();
                Ok(())
            }
            None => {
                let mut row = session.clone();
                row.state = SessionState::Active;
                row.clients.clear();
                tables.sessions.insert(key, row);
                Ok(())
            }
        }
    }

    async fn find(&self, key: &SessionKey) -> StoreResult<Option<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .get(key)
            .filter(|s| s.state != SessionState::Terminated)
            .cloned())
    }

    async fn set_state(&self, key: &SessionKey, state: SessionState) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.sessions.get_mut(key) {
            row.state = state;
        }
        Ok(())
    }

    async fn set_room_info(
        &self,
        key: &SessionKey,
        room_info: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.sessions.get_mut(key) {
            row.room_info = room_info;
        }
        Ok(())
    }

    async fn terminate(&self, key: &SessionKey) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.sessions.get_mut(key) {
            row.state = SessionState::Terminated;
            row.room_info = None;
        }
        Ok(())
    }
}
