//! 直传路径：一次请求上传若干小文件，不经过配额预留，整批在一个事务内入账。
//!
//! 每个文件先流式写入 `.uploads/direct/` 下的暂存文件，超过单文件上限立即中止；
//! 整批通过校验后再移动到最终位置。

use axum::body::Bytes;
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use std::pin::pin;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, code};
use crate::folders::FolderResolver;
use crate::hooks::{AuditOutcome, ThumbnailJob};
use crate::metadata::FileRow;
use crate::policy::{check_file_policy, resolve_mime, sanitize_filename};
use crate::quota;
use crate::storage::{StorageError, direct_staging_path, file_path};
use crate::upload::UploadService;

/// One file of a direct batch, already staged on disk.
#[derive(Debug, Clone)]
pub struct DirectFile {
    pub name: String,
    /// Folder path below the batch's base folder.
    pub relative_path: Option<String>,
    pub mime_type: Option<String>,
    /// Staging blob written by [`UploadService::stage_direct_file`].
    pub staged: String,
    pub size: u64,
}

struct Prepared {
    name: String,
    original_name: String,
    mime_type: String,
    relative_path: String,
    staged: String,
    size: i64,
}

fn too_large(name: &str, size: u64, limit: u64) -> ApiError {
    ApiError::validation(
        code::FILE_TOO_LARGE,
        format!("{name} is {size} bytes, direct uploads are limited to {limit}"),
    )
}

impl UploadService {
    /// Streams one file body into a staging blob. Stops reading as soon as the
    /// body passes the direct per-file ceiling and leaves nothing behind.
    pub async fn stage_direct_file<S>(
        &self,
        name: String,
        mime_type: Option<String>,
        body: S,
    ) -> Result<DirectFile, ApiError>
    where
        S: Stream<Item = Result<Bytes, ApiError>>,
    {
        let staged = direct_staging_path();
        let mut atomic = self.storage.create_atomic(&staged).await?;
        let copied = self.copy_capped(&name, body, atomic.file_mut()).await;
        match copied {
            Ok(size) => {
                atomic.finalize().await?;
                Ok(DirectFile {
                    name,
                    relative_path: None,
                    mime_type,
                    staged,
                    size,
                })
            }
            Err(err) => {
                atomic.cleanup().await;
                Err(err)
            }
        }
    }

    async fn copy_capped<S>(&self, name: &str, body: S, target: &mut File) -> Result<u64, ApiError>
    where
        S: Stream<Item = Result<Bytes, ApiError>>,
    {
        let limit = self.config.direct_max_file_size;
        let mut body = pin!(body);
        let mut received: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received = received.saturating_add(chunk.len() as u64);
            if received > limit {
                return Err(too_large(name, received, limit));
            }
            target.write_all(&chunk).await.map_err(StorageError::from)?;
        }
        target.flush().await.map_err(StorageError::from)?;
        Ok(received)
    }

    /// Deletes staging blobs of a batch that will not be committed. Blobs
    /// already moved into place are simply missing here.
    pub async fn discard_staged<'a>(&self, paths: impl IntoIterator<Item = &'a str>) {
        for path in paths {
            if let Err(err) = self.storage.delete(path).await {
                warn!(path, error = %err, "failed to remove staged direct upload");
            }
        }
    }

    pub async fn upload_direct(
        &self,
        user_id: Uuid,
        folder_id: Option<Uuid>,
        files: Vec<DirectFile>,
    ) -> Result<Vec<FileRow>, ApiError> {
        let count = files.len();
        let staged: Vec<String> = files.iter().map(|file| file.staged.clone()).collect();
        let result = self.try_upload_direct(user_id, folder_id, files).await;
        if result.is_err() {
            self.discard_staged(staged.iter().map(String::as_str)).await;
        }
        match &result {
            Ok(rows) => self.hooks.audit.record(
                "upload.direct",
                user_id,
                AuditOutcome::Success,
                &format!(
                    "files={} bytes={}",
                    rows.len(),
                    rows.iter().map(|row| row.size).sum::<i64>()
                ),
            ),
            Err(err) => self.hooks.audit.record(
                "upload.direct",
                user_id,
                AuditOutcome::Failure,
                &format!("files={count} code={}", err.code()),
            ),
        }
        result
    }

    async fn try_upload_direct(
        &self,
        user_id: Uuid,
        folder_id: Option<Uuid>,
        files: Vec<DirectFile>,
    ) -> Result<Vec<FileRow>, ApiError> {
        if files.is_empty() {
            return Err(ApiError::validation(code::EMPTY_BATCH, "no files in request"));
        }

        let mut prepared = Vec::with_capacity(files.len());
        for file in files {
            let name = sanitize_filename(&file.name)?;
            let mime_type = resolve_mime(file.mime_type.as_deref(), &name);
            check_file_policy(&name, &mime_type)?;
            if file.size > self.config.direct_max_file_size {
                return Err(too_large(&name, file.size, self.config.direct_max_file_size));
            }
            prepared.push(Prepared {
                name,
                original_name: file.name,
                mime_type,
                relative_path: file.relative_path.unwrap_or_default(),
                staged: file.staged,
                size: i64::try_from(file.size).unwrap_or(i64::MAX),
            });
        }

        let user = self
            .store
            .ensure_user(user_id, self.config.user_defaults)
            .await?;
        let sizes: Vec<i64> = prepared.iter().map(|file| file.size).collect();
        // Rejects before any folder or blob is created; the commit re-checks under the lock.
        quota::check_batch(&user, &sizes, self.config.max_file_size)?;

        let mut resolver = FolderResolver::new(self.store.as_ref(), user_id);
        let mut targets = Vec::with_capacity(prepared.len());
        for file in &prepared {
            targets.push(resolver.resolve(&file.relative_path, folder_id).await?);
        }
        if resolver.created_count() > 0 {
            self.hooks.listings.invalidate_file_listings(user_id);
        }

        let mut rows: Vec<FileRow> = Vec::with_capacity(prepared.len());
        for (file, target) in prepared.into_iter().zip(targets) {
            let file_id = Uuid::new_v4();
            let path = file_path(user_id, file_id, &file.name);
            if let Err(err) = self.storage.move_file(&file.staged, &path).await {
                self.discard_written(&rows).await;
                return Err(err.into());
            }
            let row = FileRow {
                id: file_id,
                name: file.name,
                original_name: file.original_name,
                mime_type: file.mime_type,
                size: file.size,
                path,
                thumbnail_path: None,
                folder_id: target,
                user_id,
                is_trash: false,
                trashed_at: None,
                is_favorite: false,
                created_at: Utc::now(),
            };
            rows.push(row);
        }

        if let Err(err) = self
            .store
            .commit_direct_batch(user_id, &rows, self.config.max_file_size)
            .await
        {
            self.discard_written(&rows).await;
            return Err(err.into());
        }

        info!(
            user_id = %user_id,
            files = rows.len(),
            "direct upload committed"
        );
        for row in &rows {
            self.hooks.thumbnails.enqueue(ThumbnailJob {
                file_id: row.id,
                path: row.path.clone(),
                mime_type: row.mime_type.clone(),
                user_id,
            });
        }
        self.hooks.listings.invalidate_file_listings(user_id);
        Ok(rows)
    }

    async fn discard_written(&self, rows: &[FileRow]) {
        for row in rows {
            if let Err(err) = self.storage.delete(&row.path).await {
                warn!(path = row.path, error = %err, "failed to remove file of rejected batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, test_config};
    use futures_util::stream;

    fn body(parts: Vec<usize>) -> impl Stream<Item = Result<Bytes, ApiError>> {
        stream::iter(
            parts
                .into_iter()
                .map(|len| Ok(Bytes::from(vec![b'x'; len])))
                .collect::<Vec<_>>(),
        )
    }

    async fn file(harness: &Harness, name: &str, relative_path: Option<&str>, len: usize) -> DirectFile {
        let mut file = harness
            .service
            .stage_direct_file(name.to_string(), None, body(vec![len]))
            .await
            .expect("stage");
        file.relative_path = relative_path.map(str::to_string);
        file
    }

    #[tokio::test]
    async fn batch_is_written_and_credited_directly() {
        let harness = Harness::new().await;
        let user = Uuid::new_v4();
        let files = vec![
            file(&harness, "a.txt", Some("docs"), 10).await,
            file(&harness, "b.png", Some("docs/img"), 20).await,
            file(&harness, "c.txt", None, 5).await,
        ];
        let rows = harness
            .service
            .upload_direct(user, None, files)
            .await
            .expect("direct");
        assert_eq!(rows.len(), 3);

        let user_row = harness.user_row(user).await;
        assert_eq!(user_row.storage_used, 35);
        assert_eq!(user_row.temp_storage, 0);
        assert_eq!(harness.files_on_disk(user), 3);
        // Staging blobs were moved, not copied.
        assert_eq!(harness.blob_count(), 3);

        let docs = harness
            .store
            .find_folder(user, None, "docs")
            .await
            .expect("find")
            .expect("docs");
        assert_eq!(rows[0].folder_id, Some(docs.id));
        assert_eq!(rows[2].folder_id, None);
        let docs = harness.store.get_folder(docs.id).await.expect("get").expect("docs");
        assert_eq!(docs.size, 30);
        assert_eq!(harness.recorder.jobs.lock().expect("jobs").len(), 3);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let harness = Harness::new().await;
        let err = harness
            .service
            .upload_direct(Uuid::new_v4(), None, Vec::new())
            .await
            .expect_err("empty");
        assert_eq!(err.code(), code::EMPTY_BATCH);
    }

    #[tokio::test]
    async fn one_bad_file_rejects_the_whole_batch() {
        let harness = Harness::new().await;
        let user = Uuid::new_v4();
        let files = vec![
            file(&harness, "ok.txt", Some("keep"), 10).await,
            file(&harness, "run.bat", None, 10).await,
        ];
        let err = harness
            .service
            .upload_direct(user, None, files)
            .await
            .expect_err("dangerous");
        assert_eq!(err.code(), code::DANGEROUS_EXTENSION);
        assert_eq!(harness.files_on_disk(user), 0);
        assert_eq!(harness.blob_count(), 0);
        assert!(
            harness
                .store
                .find_folder(user, None, "keep")
                .await
                .expect("find")
                .is_none()
        );
    }

    #[tokio::test]
    async fn oversized_body_is_cut_off_while_streaming() {
        let harness = Harness::new().await;
        let limit = test_config().direct_max_file_size as usize;
        let err = harness
            .service
            .stage_direct_file("big.txt".to_string(), None, body(vec![limit, 1, limit]))
            .await
            .expect_err("too large");
        assert_eq!(err.code(), code::FILE_TOO_LARGE);
        assert_eq!(harness.blob_count(), 0);
    }

    #[tokio::test]
    async fn body_at_the_ceiling_is_staged() {
        let harness = Harness::new().await;
        let limit = test_config().direct_max_file_size as usize;
        let staged = harness
            .service
            .stage_direct_file("edge.txt".to_string(), None, body(vec![limit / 2, limit - limit / 2]))
            .await
            .expect("stage");
        assert_eq!(staged.size, limit as u64);
        assert_eq!(harness.storage.size(&staged.staged).await.expect("size"), limit as u64);
    }

    #[tokio::test]
    async fn failed_body_leaves_no_staging_blob() {
        let harness = Harness::new().await;
        let parts = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(ApiError::validation(code::INVALID_REQUEST, "connection reset")),
        ]);
        let err = harness
            .service
            .stage_direct_file("a.txt".to_string(), None, parts)
            .await
            .expect_err("body error");
        assert_eq!(err.code(), code::INVALID_REQUEST);
        assert_eq!(harness.blob_count(), 0);
    }

    #[tokio::test]
    async fn batch_total_is_checked_against_quota() {
        let mut config = test_config();
        config.user_defaults.storage_quota = 100;
        let harness = Harness::with_config(config).await;
        let user = Uuid::new_v4();
        let files = vec![
            file(&harness, "a.txt", None, 60).await,
            file(&harness, "b.txt", None, 60).await,
        ];
        let err = harness
            .service
            .upload_direct(user, None, files)
            .await
            .expect_err("quota");
        assert_eq!(err.code(), code::QUOTA_EXCEEDED);
        assert_eq!(harness.user_row(user).await.storage_used, 0);
        assert_eq!(harness.blob_count(), 0);
    }

    #[tokio::test]
    async fn unknown_base_folder_is_not_found() {
        let harness = Harness::new().await;
        let files = vec![file(&harness, "a.txt", None, 1).await];
        let err = harness
            .service
            .upload_direct(Uuid::new_v4(), Some(Uuid::new_v4()), files)
            .await
            .expect_err("folder");
        assert_eq!(err.code(), code::NOT_FOUND);
        assert_eq!(harness.blob_count(), 0);
    }
}
