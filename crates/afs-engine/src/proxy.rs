//! Session façade.
//!
//! Every call checks the session token, resolves owners to physical paths
//! and hands the resolved operation to the session's [`Worker`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use afs_types::{File, FreeSpace, TransactionId};
use tracing::debug;

use crate::auth::Authenticator;
use crate::error::{AfsError, AfsResult};
use crate::resolver::{PathResolver, PhysicalLocation, resolve_in};
use crate::storage::Entry;
use crate::transaction::Operation;
use crate::worker::Worker;

pub struct Proxy {
    token: String,
    auth: Arc<dyn Authenticator>,
    resolver: Arc<PathResolver>,
    worker: Worker,
    /// owner → location, only for owners whose directory exists
    locations: HashMap<String, PhysicalLocation>,
}

impl Proxy {
    pub fn new(
        token: impl Into<String>,
        auth: Arc<dyn Authenticator>,
        resolver: Arc<PathResolver>,
        worker: Worker,
    ) -> Self {
        Self {
            token: token.into(),
            auth,
            resolver,
            worker,
            locations: HashMap::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    async fn validate(&self) -> AfsResult<()> {
        if self.auth.is_session_valid(&self.token).await? {
            Ok(())
        } else {
            Err(AfsError::InvalidSession)
        }
    }

    async fn locate(&mut self, owner: &str) -> AfsResult<PhysicalLocation> {
        if let Some(location) = self.locations.get(owner) {
            return Ok(location.clone());
        }
        let location = self.resolver.locate(owner).await?;
        // A location picked for a new owner is not final until it exists.
        if location.owner_dir.is_dir() {
            self.locations.insert(owner.to_string(), location.clone());
        }
        Ok(location)
    }

    async fn resolve(&mut self, owner: &str, source: &str) -> AfsResult<(PhysicalLocation, PathBuf)> {
        let location = self.locate(owner).await?;
        let path = resolve_in(&location, source)?;
        Ok((location, path))
    }

    fn to_file(owner: &str, location: &PhysicalLocation, entry: Entry) -> File {
        let relative = entry
            .path
            .strip_prefix(&location.owner_dir)
            .unwrap_or(&entry.path);
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        File {
            owner: owner.to_string(),
            path: format!("/{}", parts.join("/")),
            name: parts.last().cloned().unwrap_or_default(),
            directory: entry.is_dir(),
            size: entry.is_file().then_some(entry.size),
            last_modified: entry.modified,
            creation_time: entry.created,
            last_access: entry.accessed,
        }
    }

    fn offset(offset: i64) -> AfsResult<u64> {
        u64::try_from(offset).map_err(|_| AfsError::InvalidRange(format!("negative offset {offset}")))
    }

    // ========================================================================
    // Data operations
    // ========================================================================

    pub async fn list(&mut self, owner: &str, source: &str, recursive: bool) -> AfsResult<Vec<File>> {
        self.list_page(owner, source, recursive, None, None).await
    }

    /// A page of a listing, resuming after the entry at `after` (relative to
    /// the owner, as returned in [`File::path`]).
    pub async fn list_page(
        &mut self,
        owner: &str,
        source: &str,
        recursive: bool,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> AfsResult<Vec<File>> {
        self.validate().await?;
        let (location, path) = self.resolve(owner, source).await?;
        let after = after.map(|a| resolve_in(&location, a)).transpose()?;
        let entries = self.worker.list(&path, recursive, after, limit).await?;
        Ok(entries
            .into_iter()
            .map(|e| Self::to_file(owner, &location, e))
            .collect())
    }

    pub async fn read(&mut self, owner: &str, source: &str, offset: i64, limit: u64) -> AfsResult<Vec<u8>> {
        self.validate().await?;
        let offset = Self::offset(offset)?;
        let (_, path) = self.resolve(owner, source).await?;
        self.worker.read(&path, offset, limit).await
    }

    pub async fn write(
        &mut self,
        owner: &str,
        source: &str,
        offset: i64,
        data: Vec<u8>,
        md5: &str,
    ) -> AfsResult<()> {
        self.validate().await?;
        let offset = Self::offset(offset)?;
        let (_, path) = self.resolve(owner, source).await?;
        self.worker
            .execute(Operation::Write {
                path,
                offset,
                data,
                md5: md5.to_string(),
            })
            .await
            .map(|_| ())
    }

    /// `false` when there was nothing to delete.
    pub async fn delete(&mut self, owner: &str, source: &str) -> AfsResult<bool> {
        self.validate().await?;
        let (location, path) = self.resolve(owner, source).await?;
        if path == location.owner_dir {
            return Err(AfsError::invalid_path(format!("cannot delete owner {owner}")));
        }
        self.worker.execute(Operation::Delete { path }).await
    }

    pub async fn copy(
        &mut self,
        owner: &str,
        source: &str,
        target_owner: &str,
        target: &str,
    ) -> AfsResult<()> {
        self.validate().await?;
        let (_, src) = self.resolve(owner, source).await?;
        let (_, dst) = self.resolve(target_owner, target).await?;
        self.worker
            .execute(Operation::Copy { src, dst })
            .await
            .map(|_| ())
    }

    pub async fn move_path(
        &mut self,
        owner: &str,
        source: &str,
        target_owner: &str,
        target: &str,
    ) -> AfsResult<()> {
        self.validate().await?;
        let (from, src) = self.resolve(owner, source).await?;
        let (to, dst) = self.resolve(target_owner, target).await?;
        if src == from.owner_dir {
            return Err(AfsError::invalid_path(format!("cannot move owner {owner}")));
        }
        let across_shares = from.share_id != to.share_id;
        debug!(%across_shares, src = %src.display(), dst = %dst.display(), "move");
        self.worker
            .execute(Operation::Move {
                src,
                dst,
                across_shares,
            })
            .await
            .map(|_| ())
    }

    /// `false` when an entry of that kind was already there.
    pub async fn create(&mut self, owner: &str, source: &str, directory: bool) -> AfsResult<bool> {
        self.validate().await?;
        let (_, path) = self.resolve(owner, source).await?;
        self.worker
            .execute(Operation::Create { path, directory })
            .await
    }

    pub async fn free(&mut self, owner: &str, source: &str) -> AfsResult<FreeSpace> {
        self.validate().await?;
        let (_, path) = self.resolve(owner, source).await?;
        self.worker.free(&path).await
    }

    // ========================================================================
    // Transaction control
    // ========================================================================

    pub async fn begin(&mut self, id: TransactionId) -> AfsResult<()> {
        self.validate().await?;
        self.worker.begin(id).await
    }

    pub async fn prepare(&mut self) -> AfsResult<bool> {
        self.validate().await?;
        self.worker.prepare().await
    }

    pub async fn commit(&mut self) -> AfsResult<()> {
        self.validate().await?;
        self.worker.commit().await
    }

    pub async fn rollback(&mut self) -> AfsResult<()> {
        self.validate().await?;
        self.worker.rollback().await
    }

    pub async fn prepare_transaction(&mut self, id: TransactionId) -> AfsResult<bool> {
        self.validate().await?;
        self.worker.prepare_transaction(id).await
    }

    pub async fn commit_transaction(&mut self, id: TransactionId) -> AfsResult<()> {
        self.validate().await?;
        self.worker.commit_transaction(id).await
    }

    pub async fn rollback_transaction(&mut self, id: TransactionId) -> AfsResult<()> {
        self.validate().await?;
        self.worker.rollback_transaction(id).await
    }

    pub async fn recover(&mut self) -> AfsResult<Vec<TransactionId>> {
        self.validate().await?;
        Ok(self.worker.recover().await)
    }

    pub async fn logout(&mut self) -> AfsResult<()> {
        self.auth.logout(&self.token).await
    }

    /// Physical path of a resolved owner path, for diagnostics.
    pub async fn physical_path(&mut self, owner: &str, source: &str) -> AfsResult<PathBuf> {
        self.resolve(owner, source).await.map(|(_, p)| p)
    }

    /// Owner directory the session has memoized, if any.
    pub fn cached_location(&self, owner: &str) -> Option<&Path> {
        self.locations.get(owner).map(|l| l.owner_dir.as_path())
    }
}
