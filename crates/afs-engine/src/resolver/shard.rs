//! Shard layout and share selection.
//!
//! Owner directories live at `share/storageUuid/aa/bb/cc/permId`, where
//! `aa/bb/cc` are the leading bytes of the MD5 of the perm id. Finding an
//! owner and placing a new one are pure functions over the share list so
//! search order and placement can be checked without a filesystem.

use std::path::{Path, PathBuf};

use afs_types::ShareId;
use md5::{Digest, Md5};

use super::shares::Share;
use crate::config::AllocationPolicy;

/// Where an owner's files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalLocation {
    pub share_id: ShareId,
    /// Directory holding the owner directory, relative to the share root.
    pub shard_path: PathBuf,
    /// Absolute owner directory.
    pub owner_dir: PathBuf,
}

/// Shard directories for `perm_id`: `levels` two-hex-digit components.
pub fn shard_path(perm_id: &str, levels: usize) -> PathBuf {
    let digest = Md5::digest(perm_id.as_bytes());
    digest
        .iter()
        .take(levels)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// `storageUuid/shard` for `perm_id`, relative to a share root.
pub fn owner_parent(storage_uuid: &str, perm_id: &str, levels: usize) -> PathBuf {
    Path::new(storage_uuid).join(shard_path(perm_id, levels))
}

/// Location of `perm_id` on `share`, whether or not it exists.
pub fn location_on(share: &Share, storage_uuid: &str, perm_id: &str, levels: usize) -> PhysicalLocation {
    let parent = owner_parent(storage_uuid, perm_id, levels);
    PhysicalLocation {
        share_id: share.id.clone(),
        owner_dir: share.root.join(&parent).join(perm_id),
        shard_path: parent,
    }
}

/// First share (in list order) whose owner directory `exists` accepts.
pub fn find_existing(
    perm_id: &str,
    shares: &[Share],
    storage_uuid: &str,
    levels: usize,
    exists: impl Fn(&Path) -> bool,
) -> Option<PhysicalLocation> {
    shares
        .iter()
        .map(|share| location_on(share, storage_uuid, perm_id, levels))
        .find(|location| exists(&location.owner_dir))
}

/// Share for a new owner. `free` reports free bytes per share; shares it
/// cannot measure are skipped by `MostFreeSpace`.
pub fn allocate<'a>(
    shares: &'a [Share],
    policy: AllocationPolicy,
    free: impl Fn(&Share) -> Option<u64>,
) -> Option<&'a Share> {
    match policy {
        AllocationPolicy::FirstShare => shares.first(),
        AllocationPolicy::MostFreeSpace => {
            let mut best: Option<(&Share, u64)> = None;
            for share in shares {
                let Some(bytes) = free(share) else { continue };
                if best.is_none_or(|(_, most)| bytes > most) {
                    best = Some((share, bytes));
                }
            }
            best.map(|(share, _)| share).or_else(|| shares.first())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shares() -> Vec<Share> {
        vec![
            Share::new("1", "/store/1"),
            Share::new("2", "/store/2"),
            Share::new("3", "/store/3"),
        ]
    }

    #[test]
    fn test_shard_path_is_stable() {
        // md5("hello") = 5d41402a...
        assert_eq!(shard_path("hello", 3), PathBuf::from("5d/41/40"));
        assert_eq!(shard_path("hello", 0), PathBuf::new());
    }

    #[test]
    fn test_location_layout() {
        let location = location_on(&shares()[1], "uuid", "hello", 2);
        assert_eq!(location.owner_dir, PathBuf::from("/store/2/uuid/5d/41/hello"));
        assert_eq!(location.shard_path, PathBuf::from("uuid/5d/41"));
        assert_eq!(location.share_id, ShareId::new("2"));
    }

    #[test]
    fn test_find_existing_first_match_wins() {
        let found = find_existing("hello", &shares(), "uuid", 2, |p| {
            p.starts_with("/store/2") || p.starts_with("/store/3")
        })
        .unwrap();
        assert_eq!(found.share_id, ShareId::new("2"));
    }

    #[test]
    fn test_find_existing_none() {
        assert!(find_existing("hello", &shares(), "uuid", 2, |_| false).is_none());
    }

    #[test]
    fn test_allocate_first_share() {
        let shares = shares();
        let chosen = allocate(&shares, AllocationPolicy::FirstShare, |_| Some(0)).unwrap();
        assert_eq!(chosen.id, ShareId::new("1"));
    }

    #[test]
    fn test_allocate_most_free_space() {
        let shares = shares();
        let chosen = allocate(&shares, AllocationPolicy::MostFreeSpace, |s| match s.id.as_str() {
            "1" => Some(10),
            "2" => None,
            _ => Some(50),
        })
        .unwrap();
        assert_eq!(chosen.id, ShareId::new("3"));
    }

    #[test]
    fn test_allocate_ties_go_to_earlier_share() {
        let shares = shares();
        let chosen = allocate(&shares, AllocationPolicy::MostFreeSpace, |_| Some(7)).unwrap();
        assert_eq!(chosen.id, ShareId::new("1"));
    }

    #[test]
    fn test_allocate_empty() {
        assert!(allocate(&[], AllocationPolicy::FirstShare, |_| None).is_none());
    }
}
