//! The append-only update log.

use async_trait::async_trait;

use chorus_core::{DocumentCommit, DocumentId, DocumentUpdate, SessionKey};

use crate::error::StoreResult;

/// Default page size for update history queries.
pub const DEFAULT_UPDATE_LIMIT: usize = 100;

/// Default page size for commit history queries.
pub const DEFAULT_COMMIT_LIMIT: usize = 10;

/// Sort direction over `created_at` (ties broken by row id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first.
    Asc,
    /// Newest first (the default).
    #[default]
    Desc,
}

impl SortOrder {
    /// Parse the wire spelling (`"asc"` / `"desc"`); anything else is
    /// the default.
    #[must_use]
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some(v) if v.eq_ignore_ascii_case("asc") => Self::Asc,
            _ => Self::Desc,
        }
    }
}

/// Pagination and filtering for history queries.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Rows to skip.
    pub offset: usize,
    /// Page size; `None` selects the per-operation default.
    pub limit: Option<usize>,
    /// Sort direction.
    pub sort: SortOrder,
    /// Filter updates by committed state. Ignored for commits.
    pub committed: Option<bool>,
}

/// Append-only persistence of update rows and commit markers.
///
/// No durable total order across updates is promised; callers observe
/// `created_at`-sorted output with ties broken by id.
#[async_trait]
pub trait UpdateLog: Send + Sync {
    /// Append an update row.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidUpdate`](crate::StoreError::InvalidUpdate)
    /// if the row arrives already committed or carrying a commit cid;
    /// backend errors otherwise.
    async fn create_update(&self, update: DocumentUpdate) -> StoreResult<DocumentUpdate>;

    /// Persist a commit marker and transition every referenced update
    /// that exists to `committed = true, commit_cid = commit.cid`.
    ///
    /// Referenced ids with no row are ignored (an owner may commit
    /// before a straggling update reaches the store; the authoritative
    /// record is the CID). A warning is logged for unknown ids.
    ///
    /// # Errors
    ///
    /// Backend errors only; unknown update ids are not an error.
    async fn create_commit(&self, commit: DocumentCommit) -> StoreResult<DocumentCommit>;

    /// Page through the update rows of a document.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    async fn updates_by_document(
        &self,
        document_id: &DocumentId,
        query: &LogQuery,
    ) -> StoreResult<Vec<DocumentUpdate>>;

    /// Page through the commit rows of a document.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    async fn commits_by_document(
        &self,
        document_id: &DocumentId,
        query: &LogQuery,
    ) -> StoreResult<Vec<DocumentCommit>>;

    /// Delete every update and commit row of the session. Invoked only
    /// by the session manager on terminate.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    async fn delete_by_session(&self, key: &SessionKey) -> StoreResult<()>;
}
