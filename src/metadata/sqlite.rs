//! SQLite-backed metadata store for single-node deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::error::{MetadataError, MetadataResult, map_missing_parent, map_unique};
use super::models::*;
use super::MetadataStore;
use crate::quota;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id BLOB PRIMARY KEY,
        storage_quota INTEGER NOT NULL,
        storage_used INTEGER NOT NULL DEFAULT 0,
        temp_storage INTEGER NOT NULL DEFAULT 0,
        max_file_size INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS folders (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        parent_id BLOB REFERENCES folders(id) ON DELETE CASCADE,
        user_id BLOB NOT NULL REFERENCES users(id),
        size INTEGER NOT NULL DEFAULT 0,
        is_trash INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_folders_unique_name
        ON folders (user_id, IFNULL(parent_id, X'00'), name)
        WHERE is_trash = 0"#,
    r#"CREATE TABLE IF NOT EXISTS files (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        original_name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size INTEGER NOT NULL,
        path TEXT NOT NULL,
        thumbnail_path TEXT,
        folder_id BLOB REFERENCES folders(id),
        user_id BLOB NOT NULL REFERENCES users(id),
        is_trash INTEGER NOT NULL DEFAULT 0,
        trashed_at TEXT,
        is_favorite INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_files_user_folder ON files (user_id, folder_id)",
    r#"CREATE TABLE IF NOT EXISTS upload_sessions (
        id BLOB PRIMARY KEY,
        user_id BLOB NOT NULL REFERENCES users(id),
        filename TEXT NOT NULL,
        original_name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        total_chunks INTEGER NOT NULL,
        total_size INTEGER NOT NULL,
        folder_id BLOB,
        status TEXT NOT NULL,
        file_id BLOB,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_updated ON upload_sessions (status, updated_at)",
    r#"CREATE TABLE IF NOT EXISTS file_chunks (
        upload_id BLOB NOT NULL REFERENCES upload_sessions(id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        total_chunks INTEGER NOT NULL,
        path TEXT NOT NULL,
        size INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (upload_id, chunk_index)
    )"#,
];

const ADD_TO_ANCESTORS: &str = r#"
    WITH RECURSIVE ancestors(id, parent_id) AS (
        SELECT id, parent_id FROM folders WHERE id = ?
        UNION ALL
        SELECT f.id, f.parent_id FROM folders f JOIN ancestors a ON f.id = a.parent_id
    )
    UPDATE folders SET size = size + ? WHERE id IN (SELECT id FROM ancestors)
"#;

/// SQLite metadata store.
///
/// The pool holds a single connection, so every transaction is serialised
/// in-process and the per-user lock is implicit.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }
}

async fn lock_user(conn: &mut SqliteConnection, user_id: Uuid) -> MetadataResult<UserRow> {
    sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(MetadataError::NotFound("user"))
}

async fn add_to_ancestors(
    conn: &mut SqliteConnection,
    folder_id: Option<Uuid>,
    delta: i64,
) -> MetadataResult<()> {
    let Some(folder_id) = folder_id else {
        return Ok(());
    };
    sqlx::query(ADD_TO_ANCESTORS)
        .bind(folder_id)
        .bind(delta)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_file(conn: &mut SqliteConnection, file: &FileRow) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO files (id, name, original_name, mime_type, size, path, thumbnail_path,
                           folder_id, user_id, is_trash, trashed_at, is_favorite, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(file.id)
    .bind(&file.name)
    .bind(&file.original_name)
    .bind(&file.mime_type)
    .bind(file.size)
    .bind(&file.path)
    .bind(&file.thumbnail_path)
    .bind(file.folder_id)
    .bind(file.user_id)
    .bind(file.is_trash)
    .bind(file.trashed_at)
    .bind(file.is_favorite)
    .bind(file.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|err| map_missing_parent(err, "folder"))?;
    Ok(())
}

/// Reserve: lock the user, check headroom, add `bytes` to `temp_storage`.
async fn reserve_user(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    bytes: i64,
    global_max: i64,
) -> MetadataResult<()> {
    let user = lock_user(&mut *conn, user_id).await?;
    quota::check_reservation(&user, bytes, global_max)?;
    sqlx::query("UPDATE users SET temp_storage = temp_storage + ? WHERE id = ?")
        .bind(bytes)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Commit: credit `actual` and drop `reserved` (floored at zero) in one statement.
async fn commit_user(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    reserved: i64,
    actual: i64,
) -> MetadataResult<()> {
    sqlx::query(
        "UPDATE users SET storage_used = storage_used + ?, temp_storage = MAX(temp_storage - ?, 0) WHERE id = ?",
    )
    .bind(actual)
    .bind(reserved)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Release: drop `reserved` from `temp_storage`, floored at zero. Safe to repeat.
async fn release_user(conn: &mut SqliteConnection, user_id: Uuid, reserved: i64) -> MetadataResult<()> {
    sqlx::query("UPDATE users SET temp_storage = MAX(temp_storage - ?, 0) WHERE id = ?")
        .bind(reserved)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_user(&self, user_id: Uuid, defaults: UserDefaults) -> MetadataResult<UserRow> {
        sqlx::query(
            r#"
            INSERT INTO users (id, storage_quota, storage_used, temp_storage, max_file_size, created_at)
            VALUES (?, ?, 0, 0, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(defaults.storage_quota)
        .bind(defaults.max_file_size)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_user(user_id)
            .await?
            .ok_or(MetadataError::NotFound("user"))
    }

    async fn get_user(&self, user_id: Uuid) -> MetadataResult<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_folder(&self, folder_id: Uuid) -> MetadataResult<Option<FolderRow>> {
        let row = sqlx::query_as::<_, FolderRow>("SELECT * FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_folder(
        &self,
        user_id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> MetadataResult<Option<FolderRow>> {
        let row = sqlx::query_as::<_, FolderRow>(
            "SELECT * FROM folders WHERE user_id = ? AND parent_id IS ? AND name = ? AND is_trash = 0",
        )
        .bind(user_id)
        .bind(parent_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_folder(&self, folder: &FolderRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO folders (id, name, parent_id, user_id, size, is_trash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(folder.id)
        .bind(&folder.name)
        .bind(folder.parent_id)
        .bind(folder.user_id)
        .bind(folder.size)
        .bind(folder.is_trash)
        .bind(folder.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| map_unique(err, format!("folder '{}'", folder.name)))?;
        Ok(())
    }

    async fn create_session_with_reservation(
        &self,
        session: &UploadSessionRow,
        global_max: i64,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        reserve_user(&mut tx, session.user_id, session.total_size, global_max).await?;
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, user_id, filename, original_name, mime_type, total_chunks,
                                         total_size, folder_id, status, file_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.filename)
        .bind(&session.original_name)
        .bind(&session.mime_type)
        .bind(session.total_chunks)
        .bind(session.total_size)
        .bind(session.folder_id)
        .bind(session.status.as_str())
        .bind(session.file_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
        let row = sqlx::query_as::<_, UploadSessionRow>("SELECT * FROM upload_sessions WHERE id = ?")
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn try_begin_merge(&self, upload_id: Uuid, at: DateTime<Utc>) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = 'merging', updated_at = ? WHERE id = ? AND status = 'uploading'",
        )
        .bind(at)
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn publish_merged_file(
        &self,
        upload_id: Uuid,
        file: &FileRow,
        reserved: i64,
    ) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;
        // User row first, the same order as reservations and direct batches.
        lock_user(&mut tx, file.user_id).await?;
        let flipped = sqlx::query(
            "UPDATE upload_sessions SET status = 'completed', file_id = ?, updated_at = ? WHERE id = ? AND status = 'merging'",
        )
        .bind(file.id)
        .bind(file.created_at)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;
        if flipped.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_file(&mut tx, file).await?;
        add_to_ancestors(&mut tx, file.folder_id, file.size).await?;
        commit_user(&mut tx, file.user_id, reserved, file.size).await?;
        sqlx::query("DELETE FROM file_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn remove_session(
        &self,
        upload_id: Uuid,
        user_id: Uuid,
        guard: RemovalGuard,
    ) -> MetadataResult<SessionRemoval> {
        let mut tx = self.pool.begin().await?;
        let Some(session) = sqlx::query_as::<_, UploadSessionRow>(
            "SELECT * FROM upload_sessions WHERE id = ? AND user_id = ?",
        )
        .bind(upload_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(SessionRemoval::Missing);
        };
        if let Some(kept) = SessionRemoval::check(guard, &session) {
            tx.rollback().await?;
            return Ok(kept);
        }

        let chunk_paths: Vec<String> = sqlx::query_scalar(
            "SELECT path FROM file_chunks WHERE upload_id = ? ORDER BY chunk_index",
        )
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM file_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        let released = if session.status == UploadStatus::Completed {
            0
        } else {
            release_user(&mut tx, user_id, session.total_size).await?;
            sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
                .bind(upload_id)
                .execute(&mut *tx)
                .await?;
            session.total_size
        };
        tx.commit().await?;

        Ok(SessionRemoval::Removed(RemovedSession {
            session,
            chunk_paths,
            released,
        }))
    }

    async fn list_stale_sessions(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>> {
        let rows = sqlx::query_as::<_, UploadSessionRow>(
            r#"
            SELECT * FROM upload_sessions
            WHERE status IN ('uploading', 'merging') AND updated_at < ?
            ORDER BY updated_at
            LIMIT ?
            "#,
        )
        .bind(older_than)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_chunk(&self, upload_id: Uuid, chunk_index: i64) -> MetadataResult<Option<FileChunkRow>> {
        let row = sqlx::query_as::<_, FileChunkRow>(
            "SELECT * FROM file_chunks WHERE upload_id = ? AND chunk_index = ?",
        )
        .bind(upload_id)
        .bind(chunk_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put_chunk(&self, chunk: &FileChunkRow) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;
        let touched = sqlx::query(
            "UPDATE upload_sessions SET updated_at = ? WHERE id = ? AND status = 'uploading'",
        )
        .bind(chunk.created_at)
        .bind(chunk.upload_id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(
            r#"
            INSERT INTO file_chunks (upload_id, chunk_index, total_chunks, path, size, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (upload_id, chunk_index) DO UPDATE SET
                total_chunks = excluded.total_chunks,
                path = excluded.path,
                size = excluded.size,
                created_at = excluded.created_at
            "#,
        )
        .bind(chunk.upload_id)
        .bind(chunk.chunk_index)
        .bind(chunk.total_chunks)
        .bind(&chunk.path)
        .bind(chunk.size)
        .bind(chunk.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_missing_parent(err, "upload"))?;
        tx.commit().await?;
        Ok(true)
    }

    async fn count_chunks(&self, upload_id: Uuid) -> MetadataResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_chunks(&self, upload_id: Uuid) -> MetadataResult<Vec<FileChunkRow>> {
        let rows = sqlx::query_as::<_, FileChunkRow>(
            "SELECT * FROM file_chunks WHERE upload_id = ? ORDER BY chunk_index",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_file(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn commit_direct_batch(
        &self,
        user_id: Uuid,
        files: &[FileRow],
        global_max: i64,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        let user = lock_user(&mut tx, user_id).await?;
        let sizes: Vec<i64> = files.iter().map(|file| file.size).collect();
        let total = quota::check_batch(&user, &sizes, global_max)?;
        for file in files {
            insert_file(&mut tx, file).await?;
            add_to_ancestors(&mut tx, file.folder_id, file.size).await?;
        }
        sqlx::query("UPDATE users SET storage_used = storage_used + ? WHERE id = ?")
            .bind(total)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
