//! Storage entry types.

use std::path::PathBuf;
use std::time::SystemTime;

/// Entry kind. Symlinks are reported as what they point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// A file or directory at a physical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    pub modified: SystemTime,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

impl Entry {
    pub fn from_metadata(path: PathBuf, meta: &std::fs::Metadata) -> Self {
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Self {
            path,
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            accessed: meta.accessed().ok(),
            created: meta.created().ok(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}
