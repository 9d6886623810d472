//! Storage operations trait.
//!
//! Operations take already-resolved physical paths. Owner resolution and
//! containment checks happen before anything reaches this layer.
//!
//! Every mutation is replay safe: invoking it twice with the same
//! arguments leaves the same state as invoking it once.

use async_trait::async_trait;
use std::path::Path;

use afs_types::FreeSpace;

use super::digest;
use super::listing::Listing;
use super::types::Entry;
use crate::error::AfsResult;

#[async_trait]
pub trait StorageOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Stat a path. `None` when absent.
    async fn stat(&self, path: &Path) -> AfsResult<Option<Entry>>;

    /// Open a lazy listing.
    ///
    /// A file lists itself. A directory lists its children (all descendants
    /// when `recursive`), sorted by name, parents before children.
    async fn listing(&self, path: &Path, recursive: bool) -> AfsResult<Listing>;

    /// Collect a whole listing.
    async fn list(&self, path: &Path, recursive: bool) -> AfsResult<Vec<Entry>> {
        self.listing(path, recursive).await?.collect().await
    }

    /// Read up to `limit` bytes at `offset`.
    ///
    /// `offset == len` yields an empty buffer; `offset > len` is
    /// `InvalidRange`. The limit is clamped to the remaining bytes.
    async fn read(&self, path: &Path, offset: u64, limit: u64) -> AfsResult<Vec<u8>>;

    /// Bytes in `[offset, offset + len)`, clamped to the file. Never fails
    /// on range; used for prior-state snapshots.
    async fn read_range(&self, path: &Path, offset: u64, len: u64) -> AfsResult<Vec<u8>>;

    /// MD5 hex of a file, or a digest over a directory tree.
    async fn checksum(&self, path: &Path) -> AfsResult<String>;

    /// Capacity of the device holding `path` (or its nearest ancestor).
    async fn free(&self, path: &Path) -> AfsResult<FreeSpace>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Positional write without digest check. Creates the file and any
    /// missing parents; never truncates.
    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> AfsResult<()>;

    /// Positional write guarded by an MD5 of `data`.
    ///
    /// Fails with `ChecksumMismatch` before touching the file.
    async fn write(&self, path: &Path, offset: u64, data: &[u8], md5: &str) -> AfsResult<()> {
        digest::verify(data, md5)?;
        self.write_at(path, offset, data).await
    }

    /// Set the length of a file.
    async fn truncate(&self, path: &Path, len: u64) -> AfsResult<()>;

    /// Delete a file or a whole tree. `false` when already absent.
    async fn delete(&self, path: &Path) -> AfsResult<bool>;

    /// Remove a directory only if it is empty. `false` if absent or not empty.
    async fn remove_empty_dir(&self, path: &Path) -> AfsResult<bool>;

    /// Copy a file or tree, replacing whatever is at `dst`.
    async fn copy(&self, src: &Path, dst: &Path) -> AfsResult<()>;

    /// Move a file or tree.
    ///
    /// A rename when possible; across devices, copy, verify the checksum,
    /// then remove the source. With the source gone and the destination
    /// present this is a replayed move and returns `false`.
    async fn move_path(&self, src: &Path, dst: &Path) -> AfsResult<bool>;

    /// Create an empty file or a directory (with parents).
    ///
    /// `false` when an entry of the same kind already exists;
    /// `AlreadyExists` when one of the other kind does.
    async fn create(&self, path: &Path, directory: bool) -> AfsResult<bool>;

    /// Flush a file (or directory entry) to stable storage.
    async fn sync(&self, path: &Path) -> AfsResult<()>;
}
