//! Local filesystem storage backend used by the upload engine.
//!
//! All paths handed to [`Storage`] are relative to the storage root. Final
//! files live under `files/<user>/`, upload chunks under `.uploads/<upload>/`.
//! Both sit on one volume, so publishing a merged file is a plain rename.

use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ErrorKind, Take};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::{FILES_DIR, UPLOAD_TEMP_DIR};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath);
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// Opens a temp file beside `relative`; finalizing it publishes atomically.
    pub async fn create_atomic(&self, relative: &str) -> Result<AtomicFile, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        AtomicFile::new(&target).await
    }

    /// Writes `bytes` to `relative` through a temp file and returns the
    /// number of bytes that actually landed on disk.
    pub async fn write(&self, relative: &str, bytes: &[u8]) -> Result<u64, StorageError> {
        let mut atomic = self.create_atomic(relative).await?;
        let written = async {
            atomic.file_mut().write_all(bytes).await?;
            atomic.written_len().await
        }
        .await;
        match written {
            Ok(len) => {
                atomic.finalize().await?;
                Ok(len)
            }
            Err(err) => {
                atomic.cleanup().await;
                Err(err)
            }
        }
    }

    /// Renames within the storage root. Both paths share one volume, so the
    /// move is atomic.
    pub async fn move_file(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let source = self.resolve_path_checked(src, false).await?;
        let target = self.resolve_path_checked(dst, true).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(source, target).await?;
        Ok(())
    }

    /// Removes a file. Returns `false` when it was already gone.
    pub async fn delete(&self, relative: &str) -> Result<bool, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    pub async fn delete_dir(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    pub async fn exists(&self, relative: &str) -> Result<bool, StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::metadata(&target).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    pub async fn size(&self, relative: &str) -> Result<u64, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        Ok(fs::metadata(&target).await?.len())
    }

    /// Opens a file for reading, optionally limited to the inclusive byte
    /// range `(start, end)`.
    pub async fn open_read(
        &self,
        relative: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Take<File>, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        let mut file = File::open(&target).await?;
        match range {
            Some((start, end)) => {
                file.seek(SeekFrom::Start(start)).await?;
                Ok(file.take(end - start + 1))
            }
            None => Ok(file.take(u64::MAX)),
        }
    }

    pub async fn stream_read(
        &self,
        relative: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ReaderStream<Take<File>>, StorageError> {
        Ok(ReaderStream::new(self.open_read(relative, range).await?))
    }
}

/// Directory holding every chunk blob of one upload.
pub fn chunk_dir(upload_id: Uuid) -> String {
    format!("{UPLOAD_TEMP_DIR}/{upload_id}")
}

/// Fresh blob path for one chunk write. Every write gets its own file, so a
/// rejected or replaced write never touches a blob a merge may be reading.
pub fn new_chunk_path(upload_id: Uuid, chunk_index: i64) -> String {
    let nonce = Uuid::new_v4().simple();
    format!("{UPLOAD_TEMP_DIR}/{upload_id}/{chunk_index}.{nonce}.part")
}

/// Staging file a merge concatenates into before it is moved into place.
/// Sits beside the chunk directory so chunk cleanup never races it.
pub fn merged_path(upload_id: Uuid) -> String {
    format!("{UPLOAD_TEMP_DIR}/{upload_id}.merged")
}

/// Fresh staging blob for one file of a direct batch. The commit moves it
/// into place; a rejected batch deletes it.
pub fn direct_staging_path() -> String {
    format!("{UPLOAD_TEMP_DIR}/direct/{}.part", Uuid::new_v4().simple())
}

/// Final location of a published file. The extension is kept so the blob
/// stays recognisable on disk.
pub fn file_path(user_id: Uuid, file_id: Uuid, filename: &str) -> String {
    let extension = Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("{FILES_DIR}/{user_id}/{file_id}.{ext}"),
        None => format!("{FILES_DIR}/{user_id}/{file_id}"),
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}
