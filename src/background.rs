//! 后台任务：过期上传会话回收与缩略图队列消费。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::UPLOAD_SWEEP_INTERVAL_SECS;
use crate::hooks::ThumbnailJob;
use crate::upload::UploadService;

/// 启动后台任务（过期会话回收与缩略图任务分发）。
pub fn spawn_background_tasks(
    service: Arc<UploadService>,
    mut thumbnails: mpsc::Receiver<ThumbnailJob>,
) {
    if service.config().session_ttl.is_zero() {
        info!("stale upload sweep disabled");
    } else {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(UPLOAD_SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(err) = service.sweep_stale_sessions(Utc::now()).await {
                    warn!(error = %err, "stale upload sweep failed");
                }
            }
        });
    }

    // 缩略图生成由外部流水线负责，这里只负责交接。
    tokio::spawn(async move {
        while let Some(job) = thumbnails.recv().await {
            info!(
                file_id = %job.file_id,
                user_id = %job.user_id,
                path = %job.path,
                mime_type = %job.mime_type,
                "thumbnail job handed off"
            );
        }
    });
}
