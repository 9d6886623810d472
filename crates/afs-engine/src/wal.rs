//! Write-ahead log.
//!
//! One append-only file per transaction at `<wal_dir>/<id>.wal`. Each line
//! is `<crc32 as 8 hex digits> <json record>\n`. Replay stops at the first
//! line that fails its checksum or does not parse, which is where a torn
//! write at crash time would leave the tail.
//!
//! ```text
//! <wal_dir>/
//!   <id>.wal                          live transactions
//!   archive/<id>.committed.wal        finished (kept when archiving)
//!   archive/<id>.rolled_back.wal
//!   staging/<id>/<seq>/               prior-state snapshots
//! ```

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use afs_types::{OpKind, TransactionId, TransactionState};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{AfsError, AfsResult};
use crate::transaction::undo::UndoStep;

const LOG_EXT: &str = "wal";

/// An operation as recorded before it touches the disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub transaction_id: TransactionId,
    /// Strictly increasing within a transaction, starting at 1.
    pub seq: u64,
    pub kind: OpKind,
    pub targets: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_digest: Option<String>,
    /// `(offset, len)` for writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(u64, u64)>,
    /// Steps that reverse this operation, in execution order.
    pub undo: Vec<UndoStep>,
}

/// One WAL line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalRecord {
    Begin {
        transaction_id: TransactionId,
        created_at: u64,
    },
    Operation(OperationRecord),
    Applied {
        seq: u64,
    },
    Failed {
        seq: u64,
        reason: String,
    },
    /// Undo steps of `seq` have all run.
    Undone {
        seq: u64,
    },
    Prepared {
        at: u64,
    },
    Committing,
    Committed {
        at: u64,
    },
    RollingBack,
    RolledBack {
        at: u64,
    },
}

/// Encode a record as one checksummed line.
pub fn encode_line(record: &WalRecord) -> AfsResult<String> {
    let json = serde_json::to_string(record).map_err(|e| AfsError::wal(e.to_string()))?;
    let crc = crc32fast::hash(json.as_bytes());
    Ok(format!("{crc:08x} {json}\n"))
}

/// Decode one line (without its newline). `None` if torn or corrupt.
pub fn decode_line(line: &str) -> Option<WalRecord> {
    let (crc, json) = line.split_once(' ')?;
    let crc = u32::from_str_radix(crc, 16).ok()?;
    if crc32fast::hash(json.as_bytes()) != crc {
        return None;
    }
    serde_json::from_str(json).ok()
}

/// Read every valid record of a log, in order.
pub async fn read_log(path: &Path) -> AfsResult<Vec<WalRecord>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AfsError::wal(format!("{}: {e}", path.display())))?;
    let text = String::from_utf8_lossy(&bytes);
    let mut records = Vec::new();
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        if line.is_empty() && lines.peek().is_none() {
            break;
        }
        match decode_line(line) {
            Some(record) => records.push(record),
            None => {
                let trailing = lines.filter(|l| !l.is_empty()).count();
                warn!(
                    log = %path.display(),
                    valid = records.len(),
                    discarded = trailing + 1,
                    "stopping replay at invalid WAL line"
                );
                break;
            }
        }
    }
    Ok(records)
}

/// Append handle for one transaction's log.
#[derive(Debug)]
pub struct WalWriter {
    path: PathBuf,
    file: tokio::fs::File,
    poisoned: bool,
}

impl WalWriter {
    /// Append a record; with `durable`, fsync before returning.
    ///
    /// After a failed append the writer refuses further records: the tail
    /// may be torn and anything appended after it would be lost on replay.
    pub async fn append(&mut self, record: &WalRecord, durable: bool) -> AfsResult<()> {
        if self.poisoned {
            return Err(AfsError::wal(format!(
                "{} is poisoned by an earlier failed append",
                self.path.display()
            )));
        }
        let line = encode_line(record)?;
        let result = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.flush().await?;
            if durable {
                self.file.sync_data().await?;
            }
            Ok::<(), io::Error>(())
        }
        .await;
        result.map_err(|e| {
            self.poisoned = true;
            AfsError::wal(format!("{}: {e}", self.path.display()))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The WAL directory.
#[derive(Debug, Clone)]
pub struct WriteAheadLog {
    dir: PathBuf,
    archive: bool,
}

impl WriteAheadLog {
    /// Open (creating) the WAL directory and its `archive/` and `staging/`.
    pub async fn open(dir: impl Into<PathBuf>, archive: bool) -> AfsResult<Self> {
        let dir = dir.into();
        for sub in [dir.clone(), dir.join("archive"), dir.join("staging")] {
            tokio::fs::create_dir_all(&sub)
                .await
                .map_err(|e| AfsError::wal(format!("{}: {e}", sub.display())))?;
        }
        Ok(Self { dir, archive })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, id: TransactionId) -> PathBuf {
        self.dir.join(format!("{id}.{LOG_EXT}"))
    }

    pub fn archive_path(&self, id: TransactionId, state: TransactionState) -> PathBuf {
        let outcome = match state {
            TransactionState::Committed => "committed",
            _ => "rolled_back",
        };
        self.dir.join("archive").join(format!("{id}.{outcome}.{LOG_EXT}"))
    }

    /// Staging root of a transaction.
    pub fn staging_dir(&self, id: TransactionId) -> PathBuf {
        self.dir.join("staging").join(id.to_string())
    }

    /// Staging directory of one operation.
    pub fn staging_slot(&self, id: TransactionId, seq: u64) -> PathBuf {
        self.staging_dir(id).join(seq.to_string())
    }

    /// Create the log of a new transaction.
    pub async fn create(&self, id: TransactionId) -> AfsResult<WalWriter> {
        let path = self.log_path(id);
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => AfsError::DuplicateTransaction(id),
                _ => AfsError::wal(format!("{}: {e}", path.display())),
            })?;
        self.sync_dir().await?;
        Ok(WalWriter {
            path,
            file,
            poisoned: false,
        })
    }

    /// Reopen the log of a recovered transaction for appending.
    pub async fn reopen(&self, id: TransactionId) -> AfsResult<WalWriter> {
        let path = self.log_path(id);
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AfsError::wal(format!("{}: {e}", path.display())))?;
        Ok(WalWriter {
            path,
            file,
            poisoned: false,
        })
    }

    /// Every live log with its records.
    pub async fn scan(&self) -> AfsResult<Vec<(TransactionId, Vec<WalRecord>)>> {
        let mut rd = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| AfsError::wal(format!("{}: {e}", self.dir.display())))?;
        let mut logs = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| AfsError::wal(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| TransactionId::parse(s).ok())
            else {
                warn!(file = %path.display(), "ignoring WAL file with a foreign name");
                continue;
            };
            logs.push((id, read_log(&path).await?));
        }
        logs.sort_by_key(|(id, _)| *id);
        Ok(logs)
    }

    /// Drop a log that never got its `Begin` record.
    pub async fn discard(&self, id: TransactionId) -> AfsResult<()> {
        remove_if_present(&self.log_path(id)).await?;
        remove_tree_if_present(&self.staging_dir(id)).await
    }

    /// Archive (or delete) a finished log and drop its staging area.
    pub async fn finish(&self, id: TransactionId, state: TransactionState) -> AfsResult<()> {
        let log = self.log_path(id);
        if self.archive {
            match tokio::fs::rename(&log, self.archive_path(id, state)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(AfsError::wal(format!("{}: {e}", log.display()))),
            }
        } else {
            remove_if_present(&log).await?;
        }
        remove_tree_if_present(&self.staging_dir(id)).await?;
        debug!(transaction = %id, %state, archived = self.archive, "log finished");
        Ok(())
    }

    /// Outcome of an archived transaction, if any.
    pub async fn archived_outcome(&self, id: TransactionId) -> AfsResult<Option<TransactionState>> {
        for state in [TransactionState::Committed, TransactionState::RolledBack] {
            match tokio::fs::try_exists(self.archive_path(id, state)).await {
                Ok(true) => return Ok(Some(state)),
                Ok(false) => {}
                Err(e) => return Err(AfsError::wal(e.to_string())),
            }
        }
        Ok(None)
    }

    /// Remove staging areas of transactions that have no live log.
    pub async fn remove_orphan_staging(&self, keep: &HashSet<TransactionId>) -> AfsResult<()> {
        let staging = self.dir.join("staging");
        let mut rd = tokio::fs::read_dir(&staging)
            .await
            .map_err(|e| AfsError::wal(format!("{}: {e}", staging.display())))?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| AfsError::wal(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let known = TransactionId::parse(&name).is_ok_and(|id| keep.contains(&id));
            if !known {
                info!(staging = %entry.path().display(), "removing orphaned staging area");
                remove_tree_if_present(&entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn sync_dir(&self) -> AfsResult<()> {
        let dir = tokio::fs::File::open(&self.dir)
            .await
            .map_err(|e| AfsError::wal(format!("{}: {e}", self.dir.display())))?;
        dir.sync_all()
            .await
            .map_err(|e| AfsError::wal(format!("{}: {e}", self.dir.display())))
    }
}

async fn remove_if_present(path: &Path) -> AfsResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AfsError::wal(format!("{}: {e}", path.display()))),
    }
}

async fn remove_tree_if_present(path: &Path) -> AfsResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AfsError::io(path, e)),
    }
}
