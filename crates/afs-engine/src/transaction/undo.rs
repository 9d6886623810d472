//! Undo steps: how to put a path back the way it was.
//!
//! Each operation record carries its undo steps in the order they must run.
//! Every step is safe to run again after it already ran, and safe to run
//! when the operation it reverses never reached the disk. Rollback replay
//! after a crash depends on both.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::AfsResult;
use crate::storage::StorageOps;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum UndoStep {
    /// Write the snapshot back at `offset`, then cut the file to its
    /// original length.
    RestoreRange {
        path: PathBuf,
        offset: u64,
        snapshot: PathBuf,
        original_len: u64,
    },
    /// Remove something the operation created.
    Remove { path: PathBuf },
    /// Replace `original` with the staged copy, if one is still staged.
    Restore { staged: PathBuf, original: PathBuf },
    /// Rename `from` back to `to`, unless `to` is already back.
    MoveBack { from: PathBuf, to: PathBuf },
    /// Remove directories the operation created, deepest first, if empty.
    RemoveEmptyDirs { dirs: Vec<PathBuf> },
}

impl UndoStep {
    pub async fn apply(&self, storage: &dyn StorageOps) -> AfsResult<()> {
        trace!(step = ?self, "undo");
        match self {
            UndoStep::RestoreRange {
                path,
                offset,
                snapshot,
                original_len,
            } => {
                let bytes = storage.read_range(snapshot, 0, u64::MAX).await?;
                storage.write_at(path, *offset, &bytes).await?;
                storage.truncate(path, *original_len).await
            }
            UndoStep::Remove { path } => storage.delete(path).await.map(|_| ()),
            UndoStep::Restore { staged, original } => {
                if storage.stat(staged).await?.is_none() {
                    return Ok(());
                }
                storage.delete(original).await?;
                storage.move_path(staged, original).await.map(|_| ())
            }
            UndoStep::MoveBack { from, to } => {
                if storage.stat(to).await?.is_some() {
                    return Ok(());
                }
                storage.move_path(from, to).await.map(|_| ())
            }
            UndoStep::RemoveEmptyDirs { dirs } => {
                for dir in dirs {
                    storage.remove_empty_dir(dir).await?;
                }
                Ok(())
            }
        }
    }
}
