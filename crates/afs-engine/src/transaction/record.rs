//! Transaction records rebuilt from WAL lines.
//!
//! The in-memory record and the log never disagree: the manager appends a
//! line first and only then folds it into the record with [`TransactionRecord::apply`],
//! and recovery folds the same lines in the same order.

use std::collections::BTreeSet;
use std::path::PathBuf;

use afs_types::{TransactionId, TransactionState};

use crate::error::{AfsError, AfsResult};
use crate::wal::{OperationRecord, WalRecord};

/// What became of one logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// Logged; the mutation may or may not have reached the disk.
    Pending,
    Applied,
    /// Failed and already compensated.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEntry {
    pub record: OperationRecord,
    pub outcome: OpOutcome,
    /// Reversed during a rollback.
    pub undone: bool,
}

/// Outcome the participant has started to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub state: TransactionState,
    pub created_at: u64,
    pub operations: Vec<OperationEntry>,
    pub decision: Option<Decision>,
}

impl TransactionRecord {
    pub fn new(id: TransactionId, created_at: u64) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            created_at,
            operations: Vec::new(),
            decision: None,
        }
    }

    /// Rebuild from a log. The first record must be `Begin`.
    pub fn replay(id: TransactionId, records: &[WalRecord]) -> AfsResult<Self> {
        let Some((first, rest)) = records.split_first() else {
            return Err(AfsError::wal(format!("log of {id} is empty")));
        };
        let mut record = match first {
            WalRecord::Begin {
                transaction_id,
                created_at,
            } if *transaction_id == id => Self::new(id, *created_at),
            other => {
                return Err(AfsError::wal(format!(
                    "log of {id} starts with {other:?}"
                )));
            }
        };
        for line in rest {
            record.apply(line)?;
        }
        Ok(record)
    }

    /// Sequence number for the next operation.
    pub fn next_seq(&self) -> u64 {
        self.operations.last().map_or(1, |op| op.record.seq + 1)
    }

    /// Fold one record into the state.
    pub fn apply(&mut self, line: &WalRecord) -> AfsResult<()> {
        match line {
            WalRecord::Begin { .. } => {
                return Err(self.corrupt("second begin record"));
            }
            WalRecord::Operation(op) => {
                if self.state != TransactionState::Active {
                    return Err(self.corrupt(&format!("operation {} after {}", op.seq, self.state)));
                }
                if op.seq != self.next_seq() {
                    return Err(self.corrupt(&format!(
                        "operation {} out of order, expected {}",
                        op.seq,
                        self.next_seq()
                    )));
                }
                self.operations.push(OperationEntry {
                    record: op.clone(),
                    outcome: OpOutcome::Pending,
                    undone: false,
                });
            }
            WalRecord::Applied { seq } => self.operation_mut(*seq)?.outcome = OpOutcome::Applied,
            WalRecord::Failed { seq, reason } => {
                self.operation_mut(*seq)?.outcome = OpOutcome::Failed(reason.clone())
            }
            WalRecord::Undone { seq } => self.operation_mut(*seq)?.undone = true,
            WalRecord::Prepared { .. } => {
                if self.state != TransactionState::Active {
                    return Err(self.corrupt(&format!("prepare after {}", self.state)));
                }
                self.state = TransactionState::Prepared;
            }
            WalRecord::Committing => self.decision = Some(Decision::Commit),
            WalRecord::RollingBack => self.decision = Some(Decision::Rollback),
            WalRecord::Committed { .. } => self.state = TransactionState::Committed,
            WalRecord::RolledBack { .. } => self.state = TransactionState::RolledBack,
        }
        Ok(())
    }

    /// Paths of operations that may have changed the disk.
    pub fn held_paths(&self) -> BTreeSet<PathBuf> {
        self.operations
            .iter()
            .filter(|op| !matches!(op.outcome, OpOutcome::Failed(_)))
            .flat_map(|op| op.record.targets.iter().cloned())
            .collect()
    }

    fn operation_mut(&mut self, seq: u64) -> AfsResult<&mut OperationEntry> {
        let id = self.id;
        self.operations
            .iter_mut()
            .find(|op| op.record.seq == seq)
            .ok_or_else(|| AfsError::wal(format!("log of {id} marks unknown operation {seq}")))
    }

    fn corrupt(&self, what: &str) -> AfsError {
        AfsError::wal(format!("log of {}: {what}", self.id))
    }
}
