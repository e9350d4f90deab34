//! Side effects the upload engine emits: audit events, thumbnail jobs and
//! listing-cache invalidation. None of them may block or fail an upload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// Fire-and-forget audit log.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &str, user_id: Uuid, outcome: AuditOutcome, details: &str);
}

/// Writes audit events to the `audit` tracing target.
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &str, user_id: Uuid, outcome: AuditOutcome, details: &str) {
        info!(
            target: "audit",
            event,
            user_id = %user_id,
            outcome = outcome.as_str(),
            details,
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailJob {
    pub file_id: Uuid,
    pub path: String,
    pub mime_type: String,
    pub user_id: Uuid,
}

pub trait ThumbnailQueue: Send + Sync {
    fn enqueue(&self, job: ThumbnailJob);
}

/// Bounded in-process queue drained by a background task.
pub struct ChannelThumbnailQueue {
    sender: mpsc::Sender<ThumbnailJob>,
}

impl ChannelThumbnailQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ThumbnailJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

/// Only images and videos get thumbnails.
pub fn wants_thumbnail(mime_type: &str) -> bool {
    mime_type.starts_with("image/") || mime_type.starts_with("video/")
}

impl ThumbnailQueue for ChannelThumbnailQueue {
    fn enqueue(&self, job: ThumbnailJob) {
        if !wants_thumbnail(&job.mime_type) {
            return;
        }
        match self.sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(file_id = %job.file_id, "thumbnail queue full, job dropped");
            }
            Err(TrySendError::Closed(job)) => {
                warn!(file_id = %job.file_id, "thumbnail queue closed, job dropped");
            }
        }
    }
}

pub trait ListingInvalidator: Send + Sync {
    fn invalidate_file_listings(&self, user_id: Uuid);
}

/// Per-user listing generation. Cached listings tagged with an older
/// generation are stale.
#[derive(Default)]
pub struct ListingGenerations {
    generations: Mutex<HashMap<Uuid, u64>>,
}

impl ListingGenerations {
    #[cfg(test)]
    pub fn generation(&self, user_id: Uuid) -> u64 {
        let generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        generations.get(&user_id).copied().unwrap_or(0)
    }
}

impl ListingInvalidator for ListingGenerations {
    fn invalidate_file_listings(&self, user_id: Uuid) {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let generation = generations.entry(user_id).or_insert(0);
        *generation += 1;
        debug!(%user_id, generation = *generation, "file listings invalidated");
    }
}

/// Bundle of outbound collaborators handed to the upload service.
#[derive(Clone)]
pub struct Hooks {
    pub audit: Arc<dyn AuditSink>,
    pub thumbnails: Arc<dyn ThumbnailQueue>,
    pub listings: Arc<dyn ListingInvalidator>,
}


#[cfg(test)]
mod tests {
    use super::*;

    fn job(mime_type: &str) -> ThumbnailJob {
        ThumbnailJob {
            file_id: Uuid::new_v4(),
            path: "files/x".to_string(),
            mime_type: mime_type.to_string(),
            user_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn thumbnail_queue_only_accepts_media() {
        let (queue, mut receiver) = ChannelThumbnailQueue::new(8);
        queue.enqueue(job("application/pdf"));
        queue.enqueue(job("image/png"));
        queue.enqueue(job("video/mp4"));
        drop(queue);

        let mut received = Vec::new();
        while let Some(job) = receiver.recv().await {
            received.push(job.mime_type);
        }
        assert_eq!(received, vec!["image/png", "video/mp4"]);
    }

    #[test]
    fn full_thumbnail_queue_drops_instead_of_blocking() {
        let (queue, _receiver) = ChannelThumbnailQueue::new(1);
        queue.enqueue(job("image/png"));
        queue.enqueue(job("image/png"));
    }

    #[test]
    fn listing_generation_bumps_per_user() {
        let generations = ListingGenerations::default();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        generations.invalidate_file_listings(alice);
        generations.invalidate_file_listings(alice);
        assert_eq!(generations.generation(alice), 2);
        assert_eq!(generations.generation(bob), 0);
    }
}
