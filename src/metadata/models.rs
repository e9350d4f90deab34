//! Database models mapping to the metadata schema.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// Quota ledger fields of a user. Only the metadata store mutates them.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub storage_quota: i64,
    pub storage_used: i64,
    pub temp_storage: i64,
    pub max_file_size: i64,
    pub created_at: DateTime<Utc>,
}

/// Limits applied to users provisioned on first request.
#[derive(Debug, Clone, Copy)]
pub struct UserDefaults {
    pub storage_quota: i64,
    pub max_file_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Uploading,
    Merging,
    Completed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Merging => "merging",
            UploadStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown upload status: {0}")]
pub struct UnknownStatus(String);

impl TryFrom<String> for UploadStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "uploading" => Ok(UploadStatus::Uploading),
            "merging" => Ok(UploadStatus::Merging),
            "completed" => Ok(UploadStatus::Completed),
            _ => Err(UnknownStatus(value)),
        }
    }
}

/// One logical chunked upload.
///
/// `total_chunks`, `total_size` and `filename` never change after init; a
/// chunk request that disagrees with them is rejected.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub total_chunks: i64,
    pub total_size: i64,
    pub folder_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub status: UploadStatus,
    pub file_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct FileChunkRow {
    pub upload_id: Uuid,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub path: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

/// Published file. `size` is always the number of bytes on disk.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRow {
    pub id: Uuid,
    pub name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    #[serde(skip)]
    pub path: String,
    #[serde(skip)]
    pub thumbnail_path: Option<String>,
    pub folder_id: Option<Uuid>,
    pub user_id: Uuid,
    pub is_trash: bool,
    pub trashed_at: Option<DateTime<Utc>>,
    pub is_favorite: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct FolderRow {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub user_id: Uuid,
    /// Aggregate bytes of every file below this folder.
    pub size: i64,
    pub is_trash: bool,
    pub created_at: DateTime<Utc>,
}

/// What a cleanup removed, so the caller can delete the blobs afterwards.
#[derive(Debug, Clone)]
pub struct RemovedSession {
    pub session: UploadSessionRow,
    pub chunk_paths: Vec<String>,
    /// Bytes returned from `temp_storage`; zero for a completed session.
    pub released: i64,
}

/// Condition `remove_session` re-checks under the row lock before touching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalGuard {
    /// Client cleanup: a MERGING session belongs to its merger.
    NotMerging,
    /// Expiry sweep: the session must still be unfinished and idle since before the cutoff.
    IdleSince(DateTime<Utc>),
    /// The merger cleaning up after its own failure.
    Force,
}

impl RemovalGuard {
    fn allows(self, session: &UploadSessionRow) -> bool {
        match self {
            RemovalGuard::NotMerging => session.status != UploadStatus::Merging,
            RemovalGuard::IdleSince(cutoff) => {
                session.status != UploadStatus::Completed && session.updated_at < cutoff
            }
            RemovalGuard::Force => true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionRemoval {
    Removed(RemovedSession),
    /// No such session for this user.
    Missing,
    /// The guard failed; nothing changed. Carries the status that was seen.
    Kept(UploadStatus),
}

impl SessionRemoval {
    /// Applies `guard` to a session read inside the removing transaction.
    pub(crate) fn check(guard: RemovalGuard, session: &UploadSessionRow) -> Option<Self> {
        (!guard.allows(session)).then_some(SessionRemoval::Kept(session.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_column_text() {
        for status in [
            UploadStatus::Uploading,
            UploadStatus::Merging,
            UploadStatus::Completed,
        ] {
            let parsed = UploadStatus::try_from(status.as_str().to_string()).expect("parse");
            assert_eq!(parsed, status);
        }
        assert!(UploadStatus::try_from("done".to_string()).is_err());
    }
}
