//! 分片存储：按 (uploadId, chunkIndex) 保存分片数据与记录，重试同一分片是幂等的。

use axum::body::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::metadata::{FileChunkRow, MetadataError, MetadataStore, UploadSessionRow, UploadStatus};
use crate::storage::{Storage, chunk_dir, merged_path, new_chunk_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    Stored,
    /// An identical chunk was already present; the incoming bytes were discarded.
    Duplicate,
    /// The session stopped accepting chunks (merging, completed or removed).
    Closed,
}

#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn MetadataStore>,
    storage: Arc<Storage>,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn MetadataStore>, storage: Arc<Storage>) -> Self {
        Self { store, storage }
    }

    /// 保存一个分片。已有记录且大小一致、数据仍在时直接返回 `Duplicate`；
    /// 否则写入新数据并替换记录，旧数据在新记录落库后才删除。
    pub async fn put(
        &self,
        session: &UploadSessionRow,
        chunk_index: i64,
        bytes: &Bytes,
    ) -> Result<ChunkWrite, ApiError> {
        let upload_id = session.id;
        let incoming = i64::try_from(bytes.len()).unwrap_or(i64::MAX);

        let existing = self.store.get_chunk(upload_id, chunk_index).await?;
        if let Some(existing) = &existing
            && existing.size == incoming
            && self.blob_matches(existing).await?
        {
            debug!(%upload_id, chunk_index, "duplicate chunk ignored");
            return Ok(ChunkWrite::Duplicate);
        }

        let path = new_chunk_path(upload_id, chunk_index);
        let written = self.storage.write(&path, bytes).await?;
        let written = i64::try_from(written).unwrap_or(i64::MAX);
        if written != incoming {
            let _ = self.storage.delete(&path).await;
            return Err(ApiError::TransientStorage(format!(
                "short write for chunk {chunk_index}: {written} of {incoming} bytes"
            )));
        }

        let record = FileChunkRow {
            upload_id,
            chunk_index,
            total_chunks: session.total_chunks,
            path: path.clone(),
            size: written,
            created_at: Utc::now(),
        };
        match self.store.put_chunk(&record).await {
            Ok(true) => {}
            Ok(false) => {
                // 会话已进入合并或被清理，新写入的数据无人引用。
                let _ = self.storage.delete(&path).await;
                self.drop_orphaned_dir(upload_id).await;
                debug!(%upload_id, chunk_index, "session closed, chunk discarded");
                return Ok(ChunkWrite::Closed);
            }
            Err(err) => {
                let _ = self.storage.delete(&path).await;
                return Err(match err {
                    MetadataError::NotFound(what) => ApiError::NotFound(what),
                    other => other.into(),
                });
            }
        }

        if let Some(stale) = existing {
            warn!(
                %upload_id,
                chunk_index,
                recorded = stale.size,
                incoming,
                "replaced stale chunk record"
            );
            if let Err(err) = self.storage.delete(&stale.path).await {
                warn!(%upload_id, chunk_index, error = %err, "failed to remove stale chunk blob");
            }
        }
        debug!(%upload_id, chunk_index, size = written, "chunk stored");
        Ok(ChunkWrite::Stored)
    }

    async fn blob_matches(&self, chunk: &FileChunkRow) -> Result<bool, ApiError> {
        if !self.storage.exists(&chunk.path).await? {
            return Ok(false);
        }
        let on_disk = self.storage.size(&chunk.path).await?;
        Ok(i64::try_from(on_disk).ok() == Some(chunk.size))
    }

    /// 迟到的写入可能重新建出已被清理的分片目录。合并中的目录仍归合并方所有，不动。
    async fn drop_orphaned_dir(&self, upload_id: Uuid) {
        let merging = matches!(
            self.store.get_session(upload_id).await,
            Ok(Some(session)) if session.status == UploadStatus::Merging
        );
        if merging {
            return;
        }
        if let Err(err) = self.storage.delete_dir(&chunk_dir(upload_id)).await {
            debug!(%upload_id, error = %err, "failed to remove orphaned chunk directory");
        }
    }

    /// 尽力删除分片数据、分片目录与残留的合并暂存文件，失败只记录日志。
    pub async fn remove_blobs(&self, upload_id: Uuid, paths: &[String]) {
        let staging = merged_path(upload_id);
        for path in paths.iter().chain(std::iter::once(&staging)) {
            if let Err(err) = self.storage.delete(path).await {
                warn!(%upload_id, path, error = %err, "failed to remove chunk blob");
            }
        }
        if let Err(err) = self.storage.delete_dir(&chunk_dir(upload_id)).await {
            warn!(%upload_id, error = %err, "failed to remove chunk directory");
        }
    }
}
