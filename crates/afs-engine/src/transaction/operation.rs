//! Mutating operations on resolved paths.

use std::path::{Path, PathBuf};

use afs_types::OpKind;

/// One mutation executed under a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Write {
        path: PathBuf,
        offset: u64,
        data: Vec<u8>,
        md5: String,
    },
    Delete {
        path: PathBuf,
    },
    Copy {
        src: PathBuf,
        dst: PathBuf,
    },
    Move {
        src: PathBuf,
        dst: PathBuf,
        /// Source and destination live on different shares.
        across_shares: bool,
    },
    Create {
        path: PathBuf,
        directory: bool,
    },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Write { .. } => OpKind::Write,
            Operation::Delete { .. } => OpKind::Delete,
            Operation::Copy { .. } => OpKind::Copy,
            Operation::Move { .. } => OpKind::Move,
            Operation::Create { .. } => OpKind::Create,
        }
    }

    /// Paths recorded in the WAL: the target, or `[src, dst]`.
    pub fn targets(&self) -> Vec<PathBuf> {
        match self {
            Operation::Write { path, .. }
            | Operation::Delete { path }
            | Operation::Create { path, .. } => vec![path.clone()],
            Operation::Copy { src, dst } | Operation::Move { src, dst, .. } => {
                vec![src.clone(), dst.clone()]
            }
        }
    }

    /// Paths locked exclusively until the transaction ends.
    pub fn exclusive_paths(&self) -> Vec<&Path> {
        match self {
            Operation::Write { path, .. }
            | Operation::Delete { path }
            | Operation::Create { path, .. } => vec![path],
            Operation::Copy { dst, .. } => vec![dst],
            Operation::Move { src, dst, .. } => vec![src, dst],
        }
    }

    /// Path read (not changed) by the operation.
    pub fn shared_path(&self) -> Option<&Path> {
        match self {
            Operation::Copy { src, .. } => Some(src),
            _ => None,
        }
    }

    pub fn payload_digest(&self) -> Option<String> {
        match self {
            Operation::Write { md5, .. } => Some(md5.to_ascii_lowercase()),
            _ => None,
        }
    }

    /// `(offset, len)` of a write.
    pub fn range(&self) -> Option<(u64, u64)> {
        match self {
            Operation::Write { offset, data, .. } => Some((*offset, data.len() as u64)),
            _ => None,
        }
    }
}
