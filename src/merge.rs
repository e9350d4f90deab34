//! 合并引擎：按序拼接分片、校验实际大小，并在一个事务内发布文件。
//!
//! 只有赢得 UPLOADING → MERGING 状态切换的请求会进入这里。任何失败都会
//! 触发完整清理，保证不会留下悬空的配额预留。

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::hooks::{AuditOutcome, ThumbnailJob};
use crate::metadata::{FileChunkRow, FileRow, RemovalGuard, UploadSessionRow};
use crate::storage::{StorageError, file_path, merged_path};
use crate::upload::UploadService;

/// Chunk rows must be exactly `0..total`, ordered by index.
pub(crate) fn verify_sequence(chunks: &[FileChunkRow], total: i64) -> Result<(), ApiError> {
    let mut rows = chunks.iter();
    for expected in 0..total {
        match rows.next() {
            Some(chunk) if chunk.chunk_index == expected => {}
            Some(chunk) => {
                return Err(ApiError::CorruptSequence {
                    expected,
                    found: Some(chunk.chunk_index),
                });
            }
            None => {
                return Err(ApiError::CorruptSequence {
                    expected,
                    found: None,
                });
            }
        }
    }
    if let Some(extra) = rows.next() {
        return Err(ApiError::CorruptSequence {
            expected: total,
            found: Some(extra.chunk_index),
        });
    }
    Ok(())
}

impl UploadService {
    /// Runs the merge; on any error the session is cleaned up before the
    /// error is returned.
    pub(crate) async fn merge_or_cleanup(
        &self,
        session: &UploadSessionRow,
    ) -> Result<FileRow, ApiError> {
        match self.merge(session).await {
            Ok(file) => Ok(file),
            Err(err) => {
                warn!(
                    upload_id = %session.id,
                    user_id = %session.user_id,
                    code = err.code(),
                    error = %err,
                    "merge failed, cleaning up"
                );
                let removal = self
                    .discard_session(session.user_id, session.id, RemovalGuard::Force, err.code())
                    .await;
                if let Err(cleanup_err) = removal {
                    warn!(upload_id = %session.id, error = %cleanup_err, "cleanup after failed merge failed");
                }
                self.hooks.audit.record(
                    "upload.merge",
                    session.user_id,
                    AuditOutcome::Failure,
                    &format!("upload_id={} code={}", session.id, err.code()),
                );
                Err(err)
            }
        }
    }

    async fn merge(&self, session: &UploadSessionRow) -> Result<FileRow, ApiError> {
        let chunks = self.store.list_chunks(session.id).await?;
        verify_sequence(&chunks, session.total_chunks)?;

        let staging = merged_path(session.id);
        let mut atomic = self.storage.create_atomic(&staging).await?;
        let actual = match concat_chunks(self, &chunks, &mut atomic).await {
            Ok(len) => i64::try_from(len).unwrap_or(i64::MAX),
            Err(err) => {
                atomic.cleanup().await;
                return Err(err.into());
            }
        };
        if actual != session.total_size {
            atomic.cleanup().await;
            return Err(ApiError::SizeMismatch {
                expected: session.total_size,
                actual,
            });
        }
        atomic.finalize().await?;

        let file_id = Uuid::new_v4();
        let path = file_path(session.user_id, file_id, &session.filename);
        if let Err(err) = self.storage.move_file(&staging, &path).await {
            let _ = self.storage.delete(&staging).await;
            return Err(err.into());
        }

        let file = FileRow {
            id: file_id,
            name: session.filename.clone(),
            original_name: session.original_name.clone(),
            mime_type: session.mime_type.clone(),
            size: actual,
            path: path.clone(),
            thumbnail_path: None,
            folder_id: session.folder_id,
            user_id: session.user_id,
            is_trash: false,
            trashed_at: None,
            is_favorite: false,
            created_at: Utc::now(),
        };
        let published = self
            .store
            .publish_merged_file(session.id, &file, session.total_size)
            .await;
        match published {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.storage.delete(&path).await;
                return Err(ApiError::NotFound("upload"));
            }
            Err(err) => {
                let _ = self.storage.delete(&path).await;
                return Err(err.into());
            }
        }

        let chunk_paths: Vec<String> = chunks.into_iter().map(|chunk| chunk.path).collect();
        self.chunks.remove_blobs(session.id, &chunk_paths).await;

        info!(
            upload_id = %session.id,
            user_id = %session.user_id,
            file_id = %file.id,
            size = file.size,
            "upload merged"
        );
        self.hooks.thumbnails.enqueue(ThumbnailJob {
            file_id: file.id,
            path: file.path.clone(),
            mime_type: file.mime_type.clone(),
            user_id: file.user_id,
        });
        self.hooks.listings.invalidate_file_listings(file.user_id);
        self.hooks.audit.record(
            "upload.merge",
            file.user_id,
            AuditOutcome::Success,
            &format!("upload_id={} file_id={} size={}", session.id, file.id, file.size),
        );
        Ok(file)
    }
}

/// Streams every chunk into `target` in index order and returns the bytes on disk.
async fn concat_chunks(
    service: &UploadService,
    chunks: &[FileChunkRow],
    target: &mut AtomicFile,
) -> Result<u64, StorageError> {
    for chunk in chunks {
        let mut reader = service.storage.open_read(&chunk.path, None).await?;
        tokio::io::copy(&mut reader, target.file_mut()).await?;
    }
    target.written_len().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use crate::metadata::UploadStatus;
    use crate::testing::Harness;
    use axum::body::Bytes;

    fn row(index: i64) -> FileChunkRow {
        FileChunkRow {
            upload_id: Uuid::nil(),
            chunk_index: index,
            total_chunks: 4,
            path: String::new(),
            size: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sequence_must_be_contiguous_from_zero() {
        let full: Vec<_> = (0..4).map(row).collect();
        assert!(verify_sequence(&full, 4).is_ok());

        let gap = vec![row(0), row(1), row(3)];
        assert!(matches!(
            verify_sequence(&gap, 4),
            Err(ApiError::CorruptSequence {
                expected: 2,
                found: Some(3)
            })
        ));

        let short = vec![row(0), row(1)];
        assert!(matches!(
            verify_sequence(&short, 4),
            Err(ApiError::CorruptSequence {
                expected: 2,
                found: None
            })
        ));

        assert!(matches!(
            verify_sequence(&full, 3),
            Err(ApiError::CorruptSequence {
                expected: 3,
                found: Some(3)
            })
        ));
    }

    async fn claim(harness: &Harness, upload_id: Uuid) -> UploadSessionRow {
        assert!(
            harness
                .store
                .try_begin_merge(upload_id, Utc::now())
                .await
                .expect("cas")
        );
        harness
            .store
            .get_session(upload_id)
            .await
            .expect("get")
            .expect("session")
    }

    #[tokio::test]
    async fn gap_in_chunks_never_merges_and_cleans_up() {
        let harness = Harness::new().await;
        let user = Uuid::new_v4();
        let upload_id = harness.init(user, "data.bin", 4, 400).await;
        let session = harness
            .store
            .get_session(upload_id)
            .await
            .expect("get")
            .expect("session");
        for index in [0, 1, 3] {
            harness
                .service
                .chunks
                .put(&session, index, &Bytes::from(vec![1u8; 100]))
                .await
                .expect("chunk");
        }

        let claimed = claim(&harness, upload_id).await;
        assert_eq!(claimed.status, UploadStatus::Merging);
        let err = harness
            .service
            .merge_or_cleanup(&claimed)
            .await
            .expect_err("gap");
        assert_eq!(err.code(), code::CORRUPT_SEQUENCE);

        assert!(harness.store.get_session(upload_id).await.expect("get").is_none());
        assert_eq!(harness.user_row(user).await.temp_storage, 0);
        assert_eq!(harness.user_row(user).await.storage_used, 0);
        assert_eq!(harness.blob_count(), 0);
    }

    #[tokio::test]
    async fn size_mismatch_releases_exactly_the_reservation() {
        let harness = Harness::new().await;
        let user = Uuid::new_v4();
        // A second open upload keeps some unrelated reservation outstanding.
        harness.init(user, "other.bin", 1, 50).await;
        let upload_id = harness.init(user, "data.bin", 3, 300).await;
        let before = harness.user_row(user).await.temp_storage;
        assert_eq!(before, 350);

        let session = harness
            .store
            .get_session(upload_id)
            .await
            .expect("get")
            .expect("session");
        for (index, len) in [(0, 100), (1, 100), (2, 90)] {
            harness
                .service
                .chunks
                .put(&session, index, &Bytes::from(vec![9u8; len]))
                .await
                .expect("chunk");
        }

        let claimed = claim(&harness, upload_id).await;
        let err = harness
            .service
            .merge_or_cleanup(&claimed)
            .await
            .expect_err("mismatch");
        assert!(matches!(
            err,
            ApiError::SizeMismatch {
                expected: 300,
                actual: 290
            }
        ));

        let after = harness.user_row(user).await;
        assert_eq!(before - after.temp_storage, 300);
        assert_eq!(after.storage_used, 0);
        assert!(harness.store.get_session(upload_id).await.expect("get").is_none());
        assert_eq!(harness.store.count_chunks(upload_id).await.expect("count"), 0);
        assert_eq!(harness.blob_count(), 0);
        assert_eq!(harness.files_on_disk(user), 0);
    }

    #[tokio::test]
    async fn short_declared_size_is_caught_through_the_chunk_path() {
        let harness = Harness::new().await;
        let user = Uuid::new_v4();
        let upload_id = harness.init(user, "data.bin", 2, 150).await;
        let chunk = |index| crate::upload::ChunkParams {
            upload_id,
            chunk_index: index,
            total_chunks: 2,
            total_size: 150,
            filename: "data.bin".to_string(),
        };

        // Each chunk passes the per-chunk limit, but together they carry 200 bytes.
        harness
            .service
            .accept_chunk(user, chunk(0), Bytes::from(vec![0u8; 100]))
            .await
            .expect("first");
        let err = harness
            .service
            .accept_chunk(user, chunk(1), Bytes::from(vec![0u8; 100]))
            .await
            .expect_err("size authority");
        assert_eq!(err.code(), code::SIZE_MISMATCH);
        let user_row = harness.user_row(user).await;
        assert_eq!(user_row.storage_used, 0);
        assert_eq!(user_row.temp_storage, 0);
        assert_eq!(harness.files_on_disk(user), 0);
    }

    #[tokio::test]
    async fn merged_file_size_is_bytes_on_disk() {
        let harness = Harness::new().await;
        let user = Uuid::new_v4();
        let upload_id = harness.init(user, "photo.png", 2, 150).await;
        let session = harness
            .store
            .get_session(upload_id)
            .await
            .expect("get")
            .expect("session");
        harness
            .service
            .chunks
            .put(&session, 0, &Bytes::from(vec![1u8; 100]))
            .await
            .expect("chunk");
        harness
            .service
            .chunks
            .put(&session, 1, &Bytes::from(vec![2u8; 50]))
            .await
            .expect("chunk");

        let claimed = claim(&harness, upload_id).await;
        let file = harness
            .service
            .merge_or_cleanup(&claimed)
            .await
            .expect("merge");
        let on_disk = std::fs::metadata(harness.storage.root_path().join(&file.path))
            .expect("file")
            .len();
        assert_eq!(file.size as u64, on_disk);
        assert_eq!(harness.user_row(user).await.storage_used, 150);

        let jobs = harness.recorder.jobs.lock().expect("jobs");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].mime_type, "image/png");
        let events = harness.recorder.events.lock().expect("events");
        assert!(events.contains(&("upload.merge".to_string(), AuditOutcome::Success)));
    }
}
