//! 上传会话状态机：初始化、分片接收、清理、进度查询与过期会话回收。
//!
//! 会话状态只前进不回退：UPLOADING → MERGING → COMPLETED。跨请求的协调全部
//! 交给元数据存储的事务与条件更新，本模块不持有任何进程内锁。

use axum::body::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunks::{ChunkStore, ChunkWrite};
use crate::config::{Args, UPLOAD_SWEEP_BATCH, bytes_i64};
use crate::error::{ApiError, code};
use crate::folders::FolderResolver;
use crate::hooks::{AuditOutcome, Hooks};
use crate::metadata::{
    FileRow, MetadataStore, RemovalGuard, SessionRemoval, UploadSessionRow, UploadStatus,
    UserDefaults,
};
use crate::policy::{check_file_policy, resolve_mime, sanitize_filename};
use crate::quota::{self, QuotaSnapshot};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
    pub max_chunks: u64,
    /// Global per-file ceiling; the effective limit is the smaller of this and
    /// the user's own `max_file_size`.
    pub max_file_size: i64,
    pub direct_max_file_size: u64,
    pub user_defaults: UserDefaults,
    /// Idle time after which an unfinished session is swept. Zero disables.
    pub session_ttl: Duration,
}

impl UploadConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            max_chunk_size: args.max_chunk_size.max(1),
            max_chunks: args.upload_max_chunks.max(1),
            max_file_size: bytes_i64(args.max_file_size),
            direct_max_file_size: args.direct_max_file_size,
            user_defaults: UserDefaults {
                storage_quota: bytes_i64(args.default_user_quota),
                max_file_size: bytes_i64(args.default_user_max_file_size),
            },
            session_ttl: Duration::from_secs(args.upload_session_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUpload {
    pub filename: String,
    /// Folder path below `folder_id`, e.g. `photos/2024`. Never includes the file name.
    #[serde(default)]
    pub relative_path: Option<String>,
    pub total_chunks: i64,
    pub total_size: i64,
    #[serde(default)]
    pub folder_id: Option<Uuid>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Values the client repeats on every chunk request; they must match the session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkParams {
    pub upload_id: Uuid,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub total_size: i64,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ChunkOutcome {
    Progress {
        completed: bool,
        uploaded_chunks: i64,
        total_chunks: i64,
    },
    Completed {
        completed: bool,
        file: FileRow,
    },
}

impl ChunkOutcome {
    fn progress(uploaded_chunks: i64, total_chunks: i64) -> Self {
        ChunkOutcome::Progress {
            completed: false,
            uploaded_chunks,
            total_chunks,
        }
    }

    fn completed(file: FileRow) -> Self {
        ChunkOutcome::Completed {
            completed: true,
            file,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub upload_id: Uuid,
    pub status: UploadStatus,
    pub filename: String,
    pub uploaded_chunks: i64,
    pub total_chunks: i64,
    pub total_size: i64,
    pub file: Option<FileRow>,
}

/// Everything a chunk validator may look at.
pub(crate) struct ChunkRequest<'a> {
    pub session: &'a UploadSessionRow,
    pub params: &'a ChunkParams,
    pub chunk_len: u64,
    pub max_chunk_size: u64,
}

type ChunkCheck = fn(&ChunkRequest<'_>) -> Result<(), ApiError>;

/// Evaluated in order; the first failure wins, so error precedence is fixed here.
pub(crate) const CHUNK_CHECKS: &[(&str, ChunkCheck)] = &[
    ("declared_totals", check_declared_totals),
    ("declared_filename", check_declared_filename),
    ("chunk_index", check_chunk_index),
    ("chunk_size", check_chunk_size),
    ("file_policy", check_session_policy),
];

fn check_declared_totals(req: &ChunkRequest<'_>) -> Result<(), ApiError> {
    if req.params.total_chunks != req.session.total_chunks {
        return Err(ApiError::conflict(
            code::TOTAL_CHUNKS_MISMATCH,
            format!(
                "totalChunks {} does not match the session's {}",
                req.params.total_chunks, req.session.total_chunks
            ),
        ));
    }
    if req.params.total_size != req.session.total_size {
        return Err(ApiError::conflict(
            code::TOTAL_SIZE_MISMATCH,
            format!(
                "totalSize {} does not match the session's {}",
                req.params.total_size, req.session.total_size
            ),
        ));
    }
    Ok(())
}

fn check_declared_filename(req: &ChunkRequest<'_>) -> Result<(), ApiError> {
    let declared = sanitize_filename(&req.params.filename).ok();
    if declared.as_deref() != Some(req.session.filename.as_str()) {
        return Err(ApiError::conflict(
            code::FILENAME_MISMATCH,
            "filename does not match the upload session",
        ));
    }
    Ok(())
}

fn check_chunk_index(req: &ChunkRequest<'_>) -> Result<(), ApiError> {
    let index = req.params.chunk_index;
    if index < 0 || index >= req.session.total_chunks {
        return Err(ApiError::validation(
            code::INVALID_CHUNK_INDEX,
            format!(
                "chunk index {index} is outside 0..{}",
                req.session.total_chunks
            ),
        ));
    }
    Ok(())
}

fn check_chunk_size(req: &ChunkRequest<'_>) -> Result<(), ApiError> {
    if req.chunk_len > req.max_chunk_size {
        return Err(ApiError::validation(
            code::CHUNK_TOO_LARGE,
            format!(
                "chunk of {} bytes exceeds the {} byte limit",
                req.chunk_len, req.max_chunk_size
            ),
        ));
    }
    Ok(())
}

fn check_session_policy(req: &ChunkRequest<'_>) -> Result<(), ApiError> {
    check_file_policy(&req.session.filename, &req.session.mime_type)
}

pub(crate) fn run_chunk_checks(req: &ChunkRequest<'_>) -> Result<(), ApiError> {
    for (name, check) in CHUNK_CHECKS {
        if let Err(err) = check(req) {
            debug!(
                upload_id = %req.session.id,
                chunk_index = req.params.chunk_index,
                check = name,
                code = err.code(),
                "chunk rejected"
            );
            return Err(err);
        }
    }
    Ok(())
}

/// Checks the declared layout of a new chunked upload.
pub(crate) fn check_layout(
    total_chunks: i64,
    total_size: i64,
    config: &UploadConfig,
) -> Result<(), ApiError> {
    if total_size < 0 {
        return Err(ApiError::validation(
            code::INVALID_REQUEST,
            "totalSize must not be negative",
        ));
    }
    if total_chunks < 1 {
        return Err(ApiError::validation(
            code::INVALID_CHUNK_LAYOUT,
            "totalChunks must be at least 1",
        ));
    }
    if u64::try_from(total_chunks).map_or(true, |chunks| chunks > config.max_chunks) {
        return Err(ApiError::validation(
            code::TOO_MANY_CHUNKS,
            format!(
                "totalChunks {total_chunks} exceeds the limit of {}",
                config.max_chunks
            ),
        ));
    }
    if total_chunks > total_size.max(1) {
        return Err(ApiError::validation(
            code::INVALID_CHUNK_LAYOUT,
            "more chunks than bytes",
        ));
    }
    let capacity = total_chunks.saturating_mul(bytes_i64(config.max_chunk_size));
    if total_size > capacity {
        return Err(ApiError::validation(
            code::INVALID_CHUNK_LAYOUT,
            format!("{total_chunks} chunks cannot carry {total_size} bytes"),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct UploadService {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) storage: Arc<Storage>,
    pub(crate) chunks: ChunkStore,
    pub(crate) config: Arc<UploadConfig>,
    pub(crate) hooks: Hooks,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        storage: Arc<Storage>,
        config: UploadConfig,
        hooks: Hooks,
    ) -> Self {
        let chunks = ChunkStore::new(store.clone(), storage.clone());
        Self {
            store,
            storage,
            chunks,
            config: Arc::new(config),
            hooks,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// 初始化分片上传：校验、解析目标目录、预留配额并创建会话。
    pub async fn init_upload(&self, user_id: Uuid, request: InitUpload) -> Result<Uuid, ApiError> {
        let result = self.try_init(user_id, &request).await;
        match &result {
            Ok(upload_id) => self.hooks.audit.record(
                "upload.init",
                user_id,
                AuditOutcome::Success,
                &format!("upload_id={upload_id} size={}", request.total_size),
            ),
            Err(err) => self.hooks.audit.record(
                "upload.init",
                user_id,
                AuditOutcome::Failure,
                &format!("code={} filename={:?}", err.code(), request.filename),
            ),
        }
        result
    }

    async fn try_init(&self, user_id: Uuid, request: &InitUpload) -> Result<Uuid, ApiError> {
        let filename = sanitize_filename(&request.filename)?;
        let mime_type = resolve_mime(request.mime_type.as_deref(), &filename);
        check_file_policy(&filename, &mime_type)?;
        check_layout(request.total_chunks, request.total_size, &self.config)?;

        let user = self
            .store
            .ensure_user(user_id, self.config.user_defaults)
            .await?;
        // Early rejection avoids creating folders for an upload that cannot fit.
        quota::check_reservation(&user, request.total_size, self.config.max_file_size)?;

        let mut resolver = FolderResolver::new(self.store.as_ref(), user_id);
        let folder_id = resolver
            .resolve(
                request.relative_path.as_deref().unwrap_or(""),
                request.folder_id,
            )
            .await?;
        if resolver.created_count() > 0 {
            self.hooks.listings.invalidate_file_listings(user_id);
        }

        let now = Utc::now();
        let session = UploadSessionRow {
            id: Uuid::new_v4(),
            user_id,
            filename,
            original_name: request.filename.clone(),
            mime_type,
            total_chunks: request.total_chunks,
            total_size: request.total_size,
            folder_id,
            status: UploadStatus::Uploading,
            file_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .create_session_with_reservation(&session, self.config.max_file_size)
            .await?;
        info!(
            upload_id = %session.id,
            user_id = %user_id,
            filename = session.filename,
            total_chunks = session.total_chunks,
            total_size = session.total_size,
            "upload session created"
        );
        Ok(session.id)
    }

    /// 接收一个分片；最后一个分片到达时由唯一的胜出者执行合并。
    pub async fn accept_chunk(
        &self,
        user_id: Uuid,
        params: ChunkParams,
        bytes: Bytes,
    ) -> Result<ChunkOutcome, ApiError> {
        let session = self.owned_session(user_id, params.upload_id).await?;
        if session.status == UploadStatus::Completed {
            return self.completed_reply(&session).await;
        }

        let request = ChunkRequest {
            session: &session,
            params: &params,
            chunk_len: bytes.len() as u64,
            max_chunk_size: self.config.max_chunk_size,
        };
        if let Err(err) = run_chunk_checks(&request) {
            self.hooks.audit.record(
                "upload.chunk",
                user_id,
                AuditOutcome::Failure,
                &format!(
                    "upload_id={} chunk_index={} code={}",
                    session.id,
                    params.chunk_index,
                    err.code()
                ),
            );
            return Err(err);
        }

        if session.status == UploadStatus::Merging {
            debug!(upload_id = %session.id, chunk_index = params.chunk_index, "chunk ignored while merging");
            return self.progress_reply(&session).await;
        }

        match self.chunks.put(&session, params.chunk_index, &bytes).await? {
            ChunkWrite::Stored | ChunkWrite::Duplicate => {}
            ChunkWrite::Closed => return self.current_reply(user_id, session.id).await,
        }

        let uploaded = self.store.count_chunks(session.id).await?;
        if uploaded < session.total_chunks {
            return Ok(ChunkOutcome::progress(uploaded, session.total_chunks));
        }

        if !self.store.try_begin_merge(session.id, Utc::now()).await? {
            debug!(upload_id = %session.id, "merge already claimed by another request");
            return self.current_reply(user_id, session.id).await;
        }
        info!(upload_id = %session.id, user_id = %user_id, "all chunks received, merging");
        let file = self.merge_or_cleanup(&session).await?;
        Ok(ChunkOutcome::completed(file))
    }

    /// 用户主动清理。合并中的会话不允许清理，判断在存储事务内完成。
    pub async fn cleanup_upload(&self, user_id: Uuid, upload_id: Uuid) -> Result<(), ApiError> {
        match self
            .discard_session(user_id, upload_id, RemovalGuard::NotMerging, "client")
            .await?
        {
            SessionRemoval::Removed(_) => Ok(()),
            SessionRemoval::Missing => Err(ApiError::NotFound("upload")),
            SessionRemoval::Kept(_) => Err(ApiError::conflict(
                code::UPLOAD_MERGING,
                "upload is being merged",
            )),
        }
    }

    /// Removes chunk rows and blobs, releases the reservation and deletes the
    /// session unless it is COMPLETED, provided `guard` still holds.
    pub(crate) async fn discard_session(
        &self,
        user_id: Uuid,
        upload_id: Uuid,
        guard: RemovalGuard,
        reason: &str,
    ) -> Result<SessionRemoval, ApiError> {
        let removal = self
            .store
            .remove_session(upload_id, user_id, guard)
            .await?;
        match &removal {
            SessionRemoval::Removed(removed) => {
                self.chunks
                    .remove_blobs(upload_id, &removed.chunk_paths)
                    .await;
                info!(
                    upload_id = %upload_id,
                    user_id = %user_id,
                    reason,
                    filename = %removed.session.filename,
                    status = removed.session.status.as_str(),
                    released = removed.released,
                    chunks = removed.chunk_paths.len(),
                    "upload session cleaned up"
                );
                self.hooks.audit.record(
                    "upload.cleanup",
                    user_id,
                    AuditOutcome::Success,
                    &format!(
                        "upload_id={upload_id} reason={reason} released={}",
                        removed.released
                    ),
                );
            }
            SessionRemoval::Kept(status) => {
                debug!(upload_id = %upload_id, reason, status = status.as_str(), "cleanup skipped");
            }
            SessionRemoval::Missing => {}
        }
        Ok(removal)
    }

    pub async fn session_progress(
        &self,
        user_id: Uuid,
        upload_id: Uuid,
    ) -> Result<SessionProgress, ApiError> {
        let session = self.owned_session(user_id, upload_id).await?;
        let (uploaded_chunks, file) = match session.status {
            UploadStatus::Completed => (
                session.total_chunks,
                self.completed_file(&session).await.ok(),
            ),
            _ => (self.store.count_chunks(upload_id).await?, None),
        };
        Ok(SessionProgress {
            upload_id,
            status: session.status,
            filename: session.filename,
            uploaded_chunks,
            total_chunks: session.total_chunks,
            total_size: session.total_size,
            file,
        })
    }

    pub async fn quota(&self, user_id: Uuid) -> Result<QuotaSnapshot, ApiError> {
        let user = self
            .store
            .ensure_user(user_id, self.config.user_defaults)
            .await?;
        Ok(QuotaSnapshot::from(&user))
    }

    /// A non-trashed file owned by `user_id`.
    pub async fn get_owned_file(&self, user_id: Uuid, file_id: Uuid) -> Result<FileRow, ApiError> {
        match self.store.get_file(file_id).await? {
            Some(file) if file.user_id == user_id && !file.is_trash => Ok(file),
            _ => Err(ApiError::NotFound("file")),
        }
    }

    /// 回收空闲超过 TTL 的未完成会话，返回清理数量。
    pub async fn sweep_stale_sessions(&self, now: DateTime<Utc>) -> Result<usize, ApiError> {
        if self.config.session_ttl.is_zero() {
            return Ok(0);
        }
        let Some(older_than) = TimeDelta::from_std(self.config.session_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        else {
            return Ok(0);
        };

        let mut swept = 0;
        loop {
            let stale = self
                .store
                .list_stale_sessions(older_than, UPLOAD_SWEEP_BATCH)
                .await?;
            let batch_len = stale.len();
            let mut progressed = false;
            for session in stale {
                let guard = RemovalGuard::IdleSince(older_than);
                match self
                    .discard_session(session.user_id, session.id, guard, "expired")
                    .await
                {
                    Ok(SessionRemoval::Removed(_)) => {
                        swept += 1;
                        progressed = true;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(upload_id = %session.id, error = %err, "failed to sweep stale upload");
                    }
                }
            }
            if batch_len < UPLOAD_SWEEP_BATCH as usize || !progressed {
                break;
            }
        }
        if swept > 0 {
            info!(swept, "stale upload sessions swept");
        }
        Ok(swept)
    }

    /// Foreign and missing sessions are indistinguishable to the caller.
    async fn owned_session(
        &self,
        user_id: Uuid,
        upload_id: Uuid,
    ) -> Result<UploadSessionRow, ApiError> {
        match self.store.get_session(upload_id).await? {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => Err(ApiError::NotFound("upload")),
        }
    }

    async fn completed_file(&self, session: &UploadSessionRow) -> Result<FileRow, ApiError> {
        let file_id = session
            .file_id
            .ok_or_else(|| ApiError::Internal(format!("completed upload {} has no file", session.id)))?;
        self.store
            .get_file(file_id)
            .await?
            .ok_or(ApiError::NotFound("file"))
    }

    async fn completed_reply(&self, session: &UploadSessionRow) -> Result<ChunkOutcome, ApiError> {
        Ok(ChunkOutcome::completed(self.completed_file(session).await?))
    }

    async fn progress_reply(&self, session: &UploadSessionRow) -> Result<ChunkOutcome, ApiError> {
        let uploaded = self.store.count_chunks(session.id).await?;
        Ok(ChunkOutcome::progress(uploaded, session.total_chunks))
    }

    /// Re-reads the session after losing a race with a merger or a cleanup.
    async fn current_reply(&self, user_id: Uuid, upload_id: Uuid) -> Result<ChunkOutcome, ApiError> {
        let session = self.owned_session(user_id, upload_id).await?;
        match session.status {
            UploadStatus::Completed => self.completed_reply(&session).await,
            _ => self.progress_reply(&session).await,
        }
    }
}
