//! Shared fixtures for service and handler tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::FILES_DIR;
use crate::hooks::testing::{Recorder, recording_hooks};
use crate::metadata::{MetadataStore, SqliteStore, UserDefaults, UserRow};
use crate::storage::Storage;
use crate::upload::{InitUpload, UploadConfig, UploadService};

/// Small limits so tests can hit every ceiling with a few hundred bytes.
pub fn test_config() -> UploadConfig {
    UploadConfig {
        max_chunk_size: 100,
        max_chunks: 16,
        max_file_size: 1_000_000,
        direct_max_file_size: 1_000,
        user_defaults: UserDefaults {
            storage_quota: 10_000,
            max_file_size: 1_000,
        },
        session_ttl: Duration::from_secs(3600),
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub store: Arc<dyn MetadataStore>,
    pub storage: Arc<Storage>,
    pub service: UploadService,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: UploadConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("metadata.db"))
                .await
                .expect("store"),
        );
        let storage = Arc::new(Storage::new(temp.path().join("storage")));
        storage.ensure_root().await.expect("storage root");
        let (recorder, hooks) = recording_hooks();
        let service = UploadService::new(store.clone(), storage.clone(), config, hooks);
        Self {
            temp,
            store,
            storage,
            service,
            recorder,
        }
    }

    /// Starts a chunked upload at the root folder.
    pub async fn init(&self, user_id: Uuid, filename: &str, total_chunks: i64, total_size: i64) -> Uuid {
        self.service
            .init_upload(
                user_id,
                InitUpload {
                    filename: filename.to_string(),
                    relative_path: None,
                    total_chunks,
                    total_size,
                    folder_id: None,
                    mime_type: None,
                },
            )
            .await
            .expect("init upload")
    }

    pub async fn user_row(&self, user_id: Uuid) -> UserRow {
        self.store
            .get_user(user_id)
            .await
            .expect("get user")
            .expect("user exists")
    }

    /// Regular files anywhere under the storage root.
    pub fn blob_count(&self) -> usize {
        count_files(self.storage.root_path())
    }

    /// Published files of one user.
    pub fn files_on_disk(&self, user_id: Uuid) -> usize {
        count_files(
            &self
                .storage
                .root_path()
                .join(FILES_DIR)
                .join(user_id.to_string()),
        )
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}
