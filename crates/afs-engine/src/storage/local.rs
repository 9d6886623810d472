//! Local filesystem storage.
//!
//! Paths arrive fully resolved; this layer only performs the primitive
//! operation and keeps each one replay safe.

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use afs_types::FreeSpace;

use super::digest;
use super::listing::Listing;
use super::ops::StorageOps;
use super::types::Entry;
use crate::error::{AfsError, AfsResult};

/// Storage on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_parent(path: &Path) -> AfsResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AfsError::io(parent, e))?;
        }
        Ok(())
    }

    async fn copy_tree(src: &Path, dst: &Path) -> AfsResult<()> {
        let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];
        while let Some((from, to)) = pending.pop() {
            fs::create_dir_all(&to).await.map_err(|e| AfsError::io(&to, e))?;
            let mut rd = fs::read_dir(&from).await.map_err(|e| AfsError::io(&from, e))?;
            while let Some(entry) = rd.next_entry().await.map_err(|e| AfsError::io(&from, e))? {
                let child = entry.path();
                let target = to.join(entry.file_name());
                let meta = fs::metadata(&child)
                    .await
                    .map_err(|e| AfsError::io(&child, e))?;
                if meta.is_dir() {
                    pending.push((child, target));
                } else {
                    fs::copy(&child, &target)
                        .await
                        .map_err(|e| AfsError::io(&target, e))?;
                }
            }
        }
        Ok(())
    }
}

/// Nearest existing ancestor of `path` (itself included).
pub fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

/// `statvfs` numbers for the device holding `path`.
pub fn free_space(path: &Path) -> AfsResult<FreeSpace> {
    let anchor = existing_ancestor(path).ok_or_else(|| AfsError::not_found(path.display().to_string()))?;
    let stat = rustix::fs::statvfs(anchor).map_err(|e| AfsError::io(anchor, e.into()))?;
    let frsize = stat.f_frsize;
    Ok(FreeSpace {
        total_bytes: stat.f_blocks.saturating_mul(frsize),
        free_bytes: stat.f_bavail.saturating_mul(frsize),
    })
}

#[async_trait]
impl StorageOps for LocalStorage {
    async fn stat(&self, path: &Path) -> AfsResult<Option<Entry>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(Entry::from_metadata(path.to_path_buf(), &meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AfsError::io(path, e)),
        }
    }

    async fn listing(&self, path: &Path, recursive: bool) -> AfsResult<Listing> {
        Listing::open(path, recursive).await
    }

    async fn read(&self, path: &Path, offset: u64, limit: u64) -> AfsResult<Vec<u8>> {
        let meta = fs::metadata(path).await.map_err(|e| AfsError::io(path, e))?;
        if meta.is_dir() {
            return Err(AfsError::NotAFile(path.display().to_string()));
        }
        if offset > meta.len() {
            return Err(AfsError::InvalidRange(format!(
                "offset {offset} beyond end of {} ({} bytes)",
                path.display(),
                meta.len()
            )));
        }
        self.read_range(path, offset, limit).await
    }

    async fn read_range(&self, path: &Path, offset: u64, len: u64) -> AfsResult<Vec<u8>> {
        let mut file = fs::File::open(path).await.map_err(|e| AfsError::io(path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| AfsError::io(path, e))?
            .len();
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset);
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| AfsError::io(path, e))?;
        let mut buffer = Vec::with_capacity(len as usize);
        file.take(len)
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| AfsError::io(path, e))?;
        Ok(buffer)
    }

    async fn checksum(&self, path: &Path) -> AfsResult<String> {
        let meta = fs::metadata(path).await.map_err(|e| AfsError::io(path, e))?;
        if meta.is_dir() {
            digest::tree_md5(path).await
        } else {
            digest::file_md5(path).await
        }
    }

    async fn free(&self, path: &Path) -> AfsResult<FreeSpace> {
        free_space(path)
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> AfsResult<()> {
        Self::ensure_parent(path).await?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| AfsError::io(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| AfsError::io(path, e))?;
        file.write_all(data).await.map_err(|e| AfsError::io(path, e))?;
        file.flush().await.map_err(|e| AfsError::io(path, e))?;
        Ok(())
    }

    async fn truncate(&self, path: &Path, len: u64) -> AfsResult<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| AfsError::io(path, e))?;
        file.set_len(len).await.map_err(|e| AfsError::io(path, e))
    }

    async fn delete(&self, path: &Path) -> AfsResult<bool> {
        let meta = match fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(AfsError::io(path, e)),
        };
        let result = if meta.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AfsError::io(path, e)),
        }
    }

    async fn remove_empty_dir(&self, path: &Path) -> AfsResult<bool> {
        match fs::remove_dir(path).await {
            Ok(()) => Ok(true),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(AfsError::io(path, e)),
        }
    }

    async fn copy(&self, src: &Path, dst: &Path) -> AfsResult<()> {
        let meta = fs::metadata(src).await.map_err(|e| AfsError::io(src, e))?;
        if src == dst {
            return Ok(());
        }
        if dst.starts_with(src) {
            return Err(AfsError::invalid_path(format!(
                "cannot copy {} into itself",
                src.display()
            )));
        }
        self.delete(dst).await?;
        Self::ensure_parent(dst).await?;
        if meta.is_dir() {
            Self::copy_tree(src, dst).await
        } else {
            fs::copy(src, dst)
                .await
                .map(|_| ())
                .map_err(|e| AfsError::io(dst, e))
        }
    }

    async fn move_path(&self, src: &Path, dst: &Path) -> AfsResult<bool> {
        if fs::symlink_metadata(src).await.is_err() {
            if fs::symlink_metadata(dst).await.is_ok() {
                debug!(src = %src.display(), dst = %dst.display(), "move already applied");
                return Ok(false);
            }
            return Err(AfsError::not_found(src.display().to_string()));
        }
        if src == dst {
            return Ok(false);
        }
        if dst.starts_with(src) {
            return Err(AfsError::invalid_path(format!(
                "cannot move {} into itself",
                src.display()
            )));
        }
        self.delete(dst).await?;
        Self::ensure_parent(dst).await?;
        match fs::rename(src, dst).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                warn!(src = %src.display(), dst = %dst.display(), "rename crosses devices, copying");
                self.copy(src, dst).await?;
                let expected = self.checksum(src).await?;
                let actual = self.checksum(dst).await?;
                if expected != actual {
                    self.delete(dst).await?;
                    return Err(AfsError::StorageIo {
                        path: dst.display().to_string(),
                        source: io::Error::other(format!(
                            "copy verification failed: {expected} != {actual}"
                        )),
                    });
                }
                self.delete(src).await?;
                Ok(true)
            }
            Err(e) => Err(AfsError::io(src, e)),
        }
    }

    async fn create(&self, path: &Path, directory: bool) -> AfsResult<bool> {
        if let Some(existing) = self.stat(path).await? {
            return if existing.is_dir() == directory {
                Ok(false)
            } else {
                Err(AfsError::AlreadyExists(path.display().to_string()))
            };
        }
        if directory {
            fs::create_dir_all(path)
                .await
                .map_err(|e| AfsError::io(path, e))?;
            return Ok(true);
        }
        Self::ensure_parent(path).await?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(AfsError::io(path, e)),
        }
    }

    async fn sync(&self, path: &Path) -> AfsResult<()> {
        let file = fs::File::open(path).await.map_err(|e| AfsError::io(path, e))?;
        file.sync_all().await.map_err(|e| AfsError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::digest::md5_hex;
    use tempfile::TempDir;

    fn setup() -> (LocalStorage, TempDir) {
        (LocalStorage::new(), TempDir::new().unwrap())
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (storage, dir) = setup();
        let path = dir.path().join("a/b/f.txt");
        storage
            .write(&path, 0, b"hello world", &md5_hex(b"hello world"))
            .await
            .unwrap();
        assert_eq!(storage.read(&path, 6, 100).await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_positional_write_keeps_tail() {
        let (storage, dir) = setup();
        let path = dir.path().join("f");
        storage.write_at(&path, 0, b"hello world").await.unwrap();
        storage.write_at(&path, 0, b"HELLO").await.unwrap();
        assert_eq!(storage.read(&path, 0, 100).await.unwrap(), b"HELLO world");
    }

    #[tokio::test]
    async fn test_sparse_write() {
        let (storage, dir) = setup();
        let path = dir.path().join("f");
        storage.write_at(&path, 4, b"xy").await.unwrap();
        assert_eq!(storage.read(&path, 0, 100).await.unwrap(), b"\0\0\0\0xy");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_file_alone() {
        let (storage, dir) = setup();
        let path = dir.path().join("f");
        storage.write_at(&path, 0, b"original").await.unwrap();
        let err = storage
            .write(&path, 0, b"changed!", &md5_hex(b"other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AfsError::ChecksumMismatch { .. }));
        assert_eq!(storage.read(&path, 0, 100).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_read_ranges() {
        let (storage, dir) = setup();
        let path = dir.path().join("f");
        storage.write_at(&path, 0, b"abc").await.unwrap();
        assert!(storage.read(&path, 3, 10).await.unwrap().is_empty());
        assert!(matches!(
            storage.read(&path, 4, 1).await,
            Err(AfsError::InvalidRange(_))
        ));
        assert!(matches!(
            storage.read(&dir.path().join("nope"), 0, 1).await,
            Err(AfsError::NotFound(_))
        ));
        assert!(matches!(
            storage.read(dir.path(), 0, 1).await,
            Err(AfsError::NotAFile(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (storage, dir) = setup();
        let tree = dir.path().join("t");
        storage.write_at(&tree.join("x/y"), 0, b"1").await.unwrap();
        assert!(storage.delete(&tree).await.unwrap());
        assert!(!storage.delete(&tree).await.unwrap());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_create_kinds() {
        let (storage, dir) = setup();
        let d = dir.path().join("d");
        assert!(storage.create(&d, true).await.unwrap());
        assert!(!storage.create(&d, true).await.unwrap());
        assert!(matches!(
            storage.create(&d, false).await,
            Err(AfsError::AlreadyExists(_))
        ));
        let f = dir.path().join("p/q/f");
        assert!(storage.create(&f, false).await.unwrap());
        assert_eq!(storage.stat(&f).await.unwrap().unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_copy_tree_replaces_destination() {
        let (storage, dir) = setup();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        storage.write_at(&src.join("a/f"), 0, b"new").await.unwrap();
        storage.write_at(&dst.join("stale"), 0, b"old").await.unwrap();
        storage.copy(&src, &dst).await.unwrap();
        storage.copy(&src, &dst).await.unwrap();
        assert!(!dst.join("stale").exists());
        assert_eq!(storage.read(&dst.join("a/f"), 0, 10).await.unwrap(), b"new");
        assert_eq!(
            storage.checksum(&src).await.unwrap(),
            storage.checksum(&dst).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_copy_into_itself_rejected() {
        let (storage, dir) = setup();
        let src = dir.path().join("src");
        storage.create(&src, true).await.unwrap();
        assert!(matches!(
            storage.copy(&src, &src.join("inner")).await,
            Err(AfsError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_move_replay_is_noop() {
        let (storage, dir) = setup();
        let src = dir.path().join("from");
        let dst = dir.path().join("x/to");
        storage.write_at(&src, 0, b"data").await.unwrap();
        assert!(storage.move_path(&src, &dst).await.unwrap());
        assert!(!storage.move_path(&src, &dst).await.unwrap());
        assert_eq!(storage.read(&dst, 0, 10).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_move_missing_source() {
        let (storage, dir) = setup();
        let result = storage
            .move_path(&dir.path().join("a"), &dir.path().join("b"))
            .await;
        assert!(matches!(result, Err(AfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_empty_dir() {
        let (storage, dir) = setup();
        let d = dir.path().join("d");
        storage.write_at(&d.join("f"), 0, b"1").await.unwrap();
        assert!(!storage.remove_empty_dir(&d).await.unwrap());
        storage.delete(&d.join("f")).await.unwrap();
        assert!(storage.remove_empty_dir(&d).await.unwrap());
        assert!(!storage.remove_empty_dir(&d).await.unwrap());
    }

    #[tokio::test]
    async fn test_free_uses_existing_ancestor() {
        let (storage, dir) = setup();
        let free = storage.free(&dir.path().join("not/yet/here")).await.unwrap();
        assert!(free.total_bytes > 0);
        assert!(free.free_bytes <= free.total_bytes);
    }

    #[tokio::test]
    async fn test_read_range_clamps() {
        let (storage, dir) = setup();
        let path = dir.path().join("f");
        storage.write_at(&path, 0, b"abcdef").await.unwrap();
        assert_eq!(storage.read_range(&path, 4, 100).await.unwrap(), b"ef");
        assert!(storage.read_range(&path, 10, 5).await.unwrap().is_empty());
    }
}
