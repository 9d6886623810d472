//! Share discovery.
//!
//! A share is a subdirectory of the storage root, normally a mount point
//! named by a number. Shares are enumerated once at startup in a stable
//! order: numeric names ascending, then other names lexicographically.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use afs_types::ShareId;
use tracing::info;

use crate::error::{AfsError, AfsResult};

/// One physical storage mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub id: ShareId,
    pub root: PathBuf,
}

impl Share {
    pub fn new(id: impl Into<ShareId>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }
}

/// Enumeration order of share ids.
pub fn share_order(a: &ShareId, b: &ShareId) -> Ordering {
    match (a.numeric(), b.numeric()) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.as_str().cmp(b.as_str())),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.as_str().cmp(b.as_str()),
    }
}

/// List the shares under `root`. Hidden entries and plain files are ignored.
pub async fn discover_shares(root: &Path) -> AfsResult<Vec<Share>> {
    let mut rd = tokio::fs::read_dir(root)
        .await
        .map_err(|e| AfsError::Config(format!("storage root {}: {e}", root.display())))?;
    let mut shares = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(|e| AfsError::io(root, e))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir {
            shares.push(Share::new(ShareId::new(name), entry.path()));
        }
    }
    shares.sort_by(|a, b| share_order(&a.id, &b.id));
    info!(
        root = %root.display(),
        shares = ?shares.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        "discovered shares"
    );
    Ok(shares)
}
