//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::storage::StorageError;

/// 可用于原子替换的临时文件封装。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> Result<Self, StorageError> {
        let parent = target.parent().ok_or(StorageError::InvalidPath)?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}.tmp.{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 刷新缓冲并返回临时文件的实际字节数。
    pub async fn written_len(&mut self) -> Result<u64, StorageError> {
        self.file.flush().await?;
        Ok(self.file.metadata().await?.len())
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(self) -> Result<(), StorageError> {
        self.file.sync_all().await?;
        drop(self.file);

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    fs::rename(&self.temp_path, &self.target).await?;
                } else {
                    let _ = fs::remove_file(&self.temp_path).await;
                    return Err(StorageError::Io(err));
                }
            }
            #[cfg(not(windows))]
            {
                let _ = fs::remove_file(&self.temp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn cleanup_leaves_target_untouched() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.bin");

        let mut atomic = AtomicFile::new(&target).await.expect("create");
        atomic.file_mut().write_all(b"partial").await.expect("write");
        assert_eq!(atomic.written_len().await.expect("len"), 7);
        atomic.cleanup().await;

        assert!(!target.exists());
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn finalize_moves_temp_into_place() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.bin");

        let mut atomic = AtomicFile::new(&target).await.expect("create");
        atomic.file_mut().write_all(b"hello").await.expect("write");
        atomic.finalize().await.expect("finalize");

        assert_eq!(std::fs::read(&target).expect("read"), b"hello");
    }
}
