//! Metadata store abstraction: users and their quota ledger, folders, files,
//! upload sessions and chunk records.
//!
//! Every cross-request invariant lives behind this trait. Reservations take a
//! per-user lock, the merge transition is a conditional status update, and
//! folder uniqueness is a database index, so several server processes can
//! share one PostgreSQL database safely.

mod error;
mod models;
mod postgres;
mod sqlite;

pub use error::{MetadataError, MetadataResult};
pub use models::{
    FileChunkRow, FileRow, FolderRow, RemovalGuard, RemovedSession, SessionRemoval,
    UploadSessionRow, UploadStatus, UserDefaults, UserRow,
};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Creates missing tables and indexes.
    async fn migrate(&self) -> MetadataResult<()>;

    async fn health_check(&self) -> MetadataResult<()>;

    // ---- users ----

    /// Returns the user, provisioning it with `defaults` on first sight.
    async fn ensure_user(&self, user_id: Uuid, defaults: UserDefaults) -> MetadataResult<UserRow>;

    async fn get_user(&self, user_id: Uuid) -> MetadataResult<Option<UserRow>>;

    // ---- folders ----

    async fn get_folder(&self, folder_id: Uuid) -> MetadataResult<Option<FolderRow>>;

    /// Finds a non-trashed folder by name under `parent_id` (`None` is root).
    async fn find_folder(
        &self,
        user_id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> MetadataResult<Option<FolderRow>>;

    /// Inserts a folder. A concurrent twin yields `AlreadyExists`.
    async fn insert_folder(&self, folder: &FolderRow) -> MetadataResult<()>;

    // ---- upload sessions ----

    /// Reserves `session.total_size` and inserts the session in one transaction.
    async fn create_session_with_reservation(
        &self,
        session: &UploadSessionRow,
        global_max: i64,
    ) -> MetadataResult<()>;

    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Flips UPLOADING to MERGING. Returns `true` only for the single winner.
    async fn try_begin_merge(&self, upload_id: Uuid, at: DateTime<Utc>) -> MetadataResult<bool>;

    /// Inserts the file, grows ancestor folder sizes, commits the quota,
    /// marks the session COMPLETED and drops its chunk rows atomically.
    ///
    /// Returns `false` when the session is no longer MERGING (it was cleaned
    /// up concurrently); nothing is written in that case.
    async fn publish_merged_file(
        &self,
        upload_id: Uuid,
        file: &FileRow,
        reserved: i64,
    ) -> MetadataResult<bool>;

    /// Deletes the chunk rows of an owned session, and unless it is COMPLETED
    /// also releases its reservation and deletes the session row.
    ///
    /// `guard` is checked against the locked row inside the same transaction;
    /// when it fails nothing is written and `Kept` is returned.
    async fn remove_session(
        &self,
        upload_id: Uuid,
        user_id: Uuid,
        guard: RemovalGuard,
    ) -> MetadataResult<SessionRemoval>;

    /// Unfinished sessions idle since before `older_than`, oldest first.
    async fn list_stale_sessions(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    // ---- chunks ----

    async fn get_chunk(&self, upload_id: Uuid, chunk_index: i64)
    -> MetadataResult<Option<FileChunkRow>>;

    /// Upserts a chunk record (replacing any record for the same index) and
    /// bumps the session's `updated_at`.
    ///
    /// Returns `false` without writing when the session is gone or no longer
    /// UPLOADING, so a late chunk cannot resurrect rows after a merge.
    async fn put_chunk(&self, chunk: &FileChunkRow) -> MetadataResult<bool>;

    async fn count_chunks(&self, upload_id: Uuid) -> MetadataResult<i64>;

    /// All chunk records ordered by index.
    async fn list_chunks(&self, upload_id: Uuid) -> MetadataResult<Vec<FileChunkRow>>;

    // ---- files ----

    async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>>;

    /// Locks the user, checks the batch total against headroom, inserts
    /// every file and credits `storage_used` directly.
    async fn commit_direct_batch(
        &self,
        user_id: Uuid,
        files: &[FileRow],
        global_max: i64,
    ) -> MetadataResult<()>;
}

/// Opens the store named by `url` (`sqlite:<path>` or `postgres://...`) and migrates it.
pub async fn connect(url: &str, max_connections: u32) -> MetadataResult<Arc<dyn MetadataStore>> {
    if let Some(path) = url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        if path.is_empty() {
            return Err(MetadataError::Config("sqlite url has no path".to_string()));
        }
        info!(path, "opening SQLite metadata store");
        let store = SqliteStore::new(path).await?;
        store.health_check().await?;
        return Ok(Arc::new(store) as Arc<dyn MetadataStore>);
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        info!("connecting to PostgreSQL metadata store");
        let store = PostgresStore::from_url(url, max_connections).await?;
        store.health_check().await?;
        return Ok(Arc::new(store) as Arc<dyn MetadataStore>);
    }
    Err(MetadataError::Config(format!(
        "unsupported database url scheme: {url}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_opens_sqlite_from_url() {
        let temp = tempfile::tempdir().expect("tempdir");
        let db_path = temp.path().join("nested").join("metadata.db");
        let url = format!("sqlite:{}", db_path.display());

        let store = connect(&url, 4).await.expect("connect");
        store.health_check().await.expect("health");
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn connect_rejects_unknown_scheme() {
        let result = connect("mysql://localhost/drive", 4).await;
        assert!(matches!(result, Err(MetadataError::Config(_))));
    }
}
