//! Path resolution: `(owner, relative path)` to a physical path.
//!
//! Resolution order for an owner:
//!
//! 1. Data sets with assigned storage: `share.root / location`, no search.
//! 2. Otherwise the first share holding `storageUuid/shard/permId`.
//! 3. Otherwise a fresh location on the share picked by the allocation
//!    policy. Nothing is created until a write lands there.
//! 4. Owners the metadata server does not know fail with `UnknownOwner`.
//!
//! Relative paths never leave the owner directory: `..` and absolute
//! prefixes are rejected outright, and symlinks pointing outside are caught
//! by canonicalizing the nearest existing ancestor.

pub mod owners;
pub mod shard;
pub mod shares;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use afs_types::ShareId;
use tracing::debug;

pub use owners::{OwnerDirectory, StaticOwnerDirectory};
pub use shard::{PhysicalLocation, allocate, find_existing, shard_path};
pub use shares::{Share, discover_shares};

use crate::config::{AllocationPolicy, StorageConfig};
use crate::error::{AfsError, AfsResult};
use crate::storage::local::{existing_ancestor, free_space};

/// A resolved path and the owner location it lies under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub location: PhysicalLocation,
    pub path: PathBuf,
}

/// Maps owners to share locations.
pub struct PathResolver {
    shares: Vec<Share>,
    storage_uuid: String,
    shard_levels: usize,
    allocation: AllocationPolicy,
    owners: Arc<dyn OwnerDirectory>,
}

impl PathResolver {
    pub fn new(
        shares: Vec<Share>,
        config: &StorageConfig,
        owners: Arc<dyn OwnerDirectory>,
    ) -> AfsResult<Self> {
        if shares.is_empty() {
            return Err(AfsError::Config(format!(
                "no shares under {}",
                config.root.display()
            )));
        }
        Ok(Self {
            shares,
            storage_uuid: config.storage_uuid.clone(),
            shard_levels: config.shard_levels,
            allocation: config.allocation,
            owners,
        })
    }

    /// Discover shares under the configured root.
    pub async fn from_config(
        config: &StorageConfig,
        owners: Arc<dyn OwnerDirectory>,
    ) -> AfsResult<Self> {
        let shares = discover_shares(&config.root).await?;
        Self::new(shares, config, owners)
    }

    pub fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub fn share(&self, id: &ShareId) -> Option<&Share> {
        self.shares.iter().find(|s| &s.id == id)
    }

    /// Physical location of an owner.
    pub async fn locate(&self, owner: &str) -> AfsResult<PhysicalLocation> {
        let info = self
            .owners
            .lookup(owner)
            .await?
            .ok_or_else(|| AfsError::UnknownOwner(owner.to_string()))?;
        let perm_id = owner_dir_name(&info.perm_id)?;

        if let Some(storage) = &info.storage {
            let share = self.share(&storage.share_id).ok_or_else(|| {
                AfsError::UnknownOwner(format!(
                    "{perm_id}: share {} is not mounted",
                    storage.share_id
                ))
            })?;
            let location = relative_path(&storage.location)?;
            return Ok(PhysicalLocation {
                share_id: share.id.clone(),
                shard_path: location.parent().map(Path::to_path_buf).unwrap_or_default(),
                owner_dir: share.root.join(&location),
            });
        }

        if let Some(found) = find_existing(
            perm_id,
            &self.shares,
            &self.storage_uuid,
            self.shard_levels,
            Path::is_dir,
        ) {
            return Ok(found);
        }

        let share = allocate(&self.shares, self.allocation, |share| {
            free_space(&share.root).ok().map(|f| f.free_bytes)
        })
        .ok_or_else(|| AfsError::Config("no shares available".into()))?;
        debug!(owner = perm_id, share = %share.id, "placing new owner");
        Ok(shard::location_on(
            share,
            &self.storage_uuid,
            perm_id,
            self.shard_levels,
        ))
    }

    /// Resolve `source` under an owner.
    pub async fn resolve(&self, owner: &str, source: &str) -> AfsResult<ResolvedPath> {
        let location = self.locate(owner).await?;
        let path = resolve_in(&location, source)?;
        Ok(ResolvedPath { location, path })
    }
}

/// Join a client-supplied relative path onto an owner directory.
pub fn resolve_in(location: &PhysicalLocation, source: &str) -> AfsResult<PathBuf> {
    let path = location.owner_dir.join(relative_path(source)?);
    check_containment(&location.owner_dir, &path)?;
    Ok(path)
}

/// Validate a client path and strip its leading `/`.
pub fn relative_path(source: &str) -> AfsResult<PathBuf> {
    if source.contains('\0') {
        return Err(AfsError::invalid_path(source.escape_default().to_string()));
    }
    let mut out = PathBuf::new();
    for component in Path::new(source.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AfsError::invalid_path(source));
            }
        }
    }
    Ok(out)
}

/// Reject `path` if its nearest existing ancestor resolves outside `owner_dir`.
pub fn check_containment(owner_dir: &Path, path: &Path) -> AfsResult<()> {
    if !owner_dir.exists() {
        return Ok(());
    }
    let root = dunce::canonicalize(owner_dir).map_err(|e| AfsError::io(owner_dir, e))?;
    let Some(anchor) = existing_ancestor(path) else {
        return Ok(());
    };
    let canonical = dunce::canonicalize(anchor).map_err(|e| AfsError::io(anchor, e))?;
    if !canonical.starts_with(&root) {
        return Err(AfsError::invalid_path(format!(
            "{} is not under {}",
            canonical.display(),
            root.display()
        )));
    }
    Ok(())
}

fn owner_dir_name(perm_id: &str) -> AfsResult<&str> {
    let mut components = Path::new(perm_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !perm_id.contains('\0') => Ok(perm_id),
        _ => Err(AfsError::invalid_path(format!("bad owner id {perm_id:?}"))),
    }
}
