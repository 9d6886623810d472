//! File descriptors returned to clients.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One entry of a listing, expressed relative to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Owner perm id.
    pub owner: String,
    /// Path relative to the owner directory, `/`-separated, leading `/`.
    pub path: String,
    /// Last path component.
    pub name: String,
    pub directory: bool,
    /// Size in bytes (absent for directories).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub last_modified: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<SystemTime>,
}

/// Capacity of the device holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeSpace {
    pub total_bytes: u64,
    pub free_bytes: u64,
}
