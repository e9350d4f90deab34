//! 目标目录解析：按相对路径逐级查找或创建目录，并发创建同一路径时收敛到同一个目录。

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use crate::config::MAX_FOLDER_CREATE_ATTEMPTS;
use crate::error::{ApiError, code};
use crate::metadata::{FolderRow, MetadataError, MetadataStore};
use crate::policy::sanitize_segment;

/// 把 `a/b\c` 形式的相对路径拆成清理后的目录名。拒绝 `..`。
pub fn split_relative_path(relative_path: &str) -> Result<Vec<String>, ApiError> {
    relative_path
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(|segment| {
            if segment == ".." {
                return Err(ApiError::validation(
                    code::INVALID_PATH,
                    "relative path must not contain '..'",
                ));
            }
            sanitize_segment(segment)
        })
        .collect()
}

/// 单次请求内使用的目录解析器，缓存已解析的路径。
pub struct FolderResolver<'a> {
    store: &'a dyn MetadataStore,
    user_id: Uuid,
    cache: HashMap<(Option<Uuid>, String), Uuid>,
    verified_bases: HashSet<Uuid>,
    created: u32,
}

impl<'a> FolderResolver<'a> {
    pub fn new(store: &'a dyn MetadataStore, user_id: Uuid) -> Self {
        Self {
            store,
            user_id,
            cache: HashMap::new(),
            verified_bases: HashSet::new(),
            created: 0,
        }
    }

    /// 本解析器实际新建的目录数量。
    pub fn created_count(&self) -> u32 {
        self.created
    }

    /// 解析 `relative_path` 在 `base` 之下对应的目录。路径为空时原样返回 `base`。
    pub async fn resolve(
        &mut self,
        relative_path: &str,
        base: Option<Uuid>,
    ) -> Result<Option<Uuid>, ApiError> {
        if let Some(base_id) = base {
            self.verify_base(base_id).await?;
        }
        let segments = split_relative_path(relative_path)?;
        if segments.is_empty() {
            return Ok(base);
        }

        let mut current = base;
        let mut walked = String::new();
        for segment in segments {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(&segment);
            let key = (base, walked.clone());
            if let Some(id) = self.cache.get(&key) {
                current = Some(*id);
                continue;
            }
            let id = self.find_or_create(current, &segment).await?;
            self.cache.insert(key, id);
            current = Some(id);
        }
        Ok(current)
    }

    async fn verify_base(&mut self, base_id: Uuid) -> Result<(), ApiError> {
        if self.verified_bases.contains(&base_id) {
            return Ok(());
        }
        match self.store.get_folder(base_id).await? {
            Some(folder) if folder.user_id == self.user_id && !folder.is_trash => {
                self.verified_bases.insert(base_id);
                Ok(())
            }
            _ => Err(ApiError::NotFound("folder")),
        }
    }

    async fn find_or_create(&mut self, parent_id: Option<Uuid>, name: &str) -> Result<Uuid, ApiError> {
        for attempt in 0..MAX_FOLDER_CREATE_ATTEMPTS {
            if let Some(existing) = self.store.find_folder(self.user_id, parent_id, name).await? {
                return Ok(existing.id);
            }
            let folder = FolderRow {
                id: Uuid::new_v4(),
                name: name.to_string(),
                parent_id,
                user_id: self.user_id,
                size: 0,
                is_trash: false,
                created_at: Utc::now(),
            };
            match self.store.insert_folder(&folder).await {
                Ok(()) => {
                    self.created += 1;
                    debug!(folder_id = %folder.id, name, "folder created");
                    return Ok(folder.id);
                }
                Err(MetadataError::AlreadyExists(_)) => {
                    debug!(name, attempt, "folder created concurrently, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ApiError::Internal(format!(
            "folder {name:?} could not be resolved after {MAX_FOLDER_CREATE_ATTEMPTS} attempts"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{SqliteStore, UserDefaults};
    use std::sync::Arc;

    const DEFAULTS: UserDefaults = UserDefaults {
        storage_quota: 1 << 30,
        max_file_size: 1 << 30,
    };

    async fn open_store() -> (tempfile::TempDir, Arc<dyn MetadataStore>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(temp.path().join("metadata.db"))
            .await
            .expect("open store");
        (temp, Arc::new(store))
    }

    #[test]
    fn split_skips_empty_segments_and_rejects_parent() {
        assert_eq!(
            split_relative_path("/a//b\\c/./").expect("split"),
            vec!["a", "b", "c"]
        );
        assert!(split_relative_path("").expect("split").is_empty());
        let err = split_relative_path("a/../b").unwrap_err();
        assert_eq!(err.code(), code::INVALID_PATH);
    }

    #[tokio::test]
    async fn empty_path_returns_base_unchanged() {
        let (_temp, store) = open_store().await;
        let user_id = Uuid::new_v4();
        store.ensure_user(user_id, DEFAULTS).await.expect("user");
        let mut resolver = FolderResolver::new(store.as_ref(), user_id);
        assert_eq!(resolver.resolve("", None).await.expect("resolve"), None);

        let base = resolver.resolve("root", None).await.expect("resolve");
        assert_eq!(resolver.resolve("/", base).await.expect("resolve"), base);
    }

    #[tokio::test]
    async fn foreign_base_folder_is_not_found() {
        let (_temp, store) = open_store().await;
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        store.ensure_user(owner, DEFAULTS).await.expect("user");
        store.ensure_user(intruder, DEFAULTS).await.expect("user");

        let mut resolver = FolderResolver::new(store.as_ref(), owner);
        let base = resolver.resolve("private", None).await.expect("resolve");

        let mut other = FolderResolver::new(store.as_ref(), intruder);
        let err = other.resolve("x", base).await.unwrap_err();
        assert_eq!(err.code(), code::NOT_FOUND);
    }

    #[tokio::test]
    async fn cache_avoids_recreating_within_one_request() {
        let (_temp, store) = open_store().await;
        let user_id = Uuid::new_v4();
        store.ensure_user(user_id, DEFAULTS).await.expect("user");
        let mut resolver = FolderResolver::new(store.as_ref(), user_id);

        let first = resolver.resolve("a/b", None).await.expect("resolve");
        let second = resolver.resolve("a/b", None).await.expect("resolve");
        let sibling = resolver.resolve("a/c", None).await.expect("resolve");
        assert_eq!(first, second);
        assert_ne!(first, sibling);
        assert_eq!(resolver.created_count(), 3);
    }

    #[tokio::test]
    async fn concurrent_resolves_converge_on_one_folder() {
        let (_temp, store) = open_store().await;
        let user_id = Uuid::new_v4();
        store.ensure_user(user_id, DEFAULTS).await.expect("user");

        let mut handles = Vec::new();
        for _ in 0..12 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut resolver = FolderResolver::new(store.as_ref(), user_id);
                let id = resolver
                    .resolve("uploads/2024/holiday", None)
                    .await
                    .expect("resolve");
                (id, resolver.created_count())
            }));
        }

        let mut ids = HashSet::new();
        let mut created = 0;
        for handle in handles {
            let (id, count) = handle.await.expect("join");
            ids.insert(id);
            created += count;
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(created, 3);
    }
}
