//! Two-phase-commit participant.
//!
//! Operations execute eagerly: each mutation is logged with the undo steps
//! that reverse it, then applied to its target path. Anything the operation
//! would destroy (deleted entries, overwritten destinations, the source of
//! a cross-share move) is moved into the transaction's staging area instead,
//! so rollback can always put it back. Commit only has to discard staging.
//!
//! WAL discipline per transaction:
//!
//! ```text
//! Begin ─ Operation(seq) ─ Applied(seq) | Failed(seq) ─ ... ─ Prepared
//!       ─ Committing ─ Committed
//!       ─ RollingBack ─ Undone(seq)... ─ RolledBack
//! ```
//!
//! `Begin`, `Prepared`, `Committing`, `RollingBack`, `Undone` and the
//! terminal records are always fsynced. A transaction whose log has no
//! terminal record at startup is in doubt: it keeps its path locks and is
//! reported by [`TransactionManager::recover`] until the coordinator decides.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use afs_types::{FreeSpace, OpKind, TransactionId, TransactionState, now_millis};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::Coordinator;
use super::locks::{LockMode, LockTable};
use super::operation::Operation;
use super::record::{Decision, OpOutcome, OperationEntry, TransactionRecord};
use super::undo::UndoStep;
use crate::config::TransactionConfig;
use crate::error::{AfsError, AfsResult};
use crate::storage::{Entry, StorageOps, digest};
use crate::wal::{OperationRecord, WalRecord, WalWriter, WriteAheadLog};

struct Transaction {
    record: TransactionRecord,
    writer: WalWriter,
    /// Session that began it. `None` for recovered transactions and ones
    /// begun by the coordinator directly.
    owner: Option<String>,
    /// Found in the WAL at startup; only the coordinator may finish it.
    recovered: bool,
    last_activity: Instant,
}

impl Transaction {
    /// Append to the log, then fold into the record.
    async fn log(&mut self, line: WalRecord, durable: bool) -> AfsResult<()> {
        self.writer.append(&line, durable).await?;
        self.record.apply(&line)
    }

    fn ensure_accepting(&self) -> AfsResult<()> {
        let id = self.record.id;
        if self.record.state != TransactionState::Active {
            return Err(AfsError::state(format!(
                "transaction {id} is {}",
                self.record.state
            )));
        }
        if self.recovered {
            return Err(AfsError::state(format!(
                "transaction {id} was recovered and awaits commit or rollback"
            )));
        }
        if self.record.decision.is_some() {
            return Err(AfsError::state(format!(
                "transaction {id} is being finished"
            )));
        }
        Ok(())
    }
}

/// How an operation will be executed and undone.
#[derive(Default)]
struct Plan {
    undo: Vec<UndoStep>,
    /// Existing target (delete) or destination (copy/move) goes here first.
    stage_target: Option<PathBuf>,
    /// Source of a cross-share move goes here after the copy is verified.
    stage_source: Option<PathBuf>,
    /// Nothing to do: the effect is already in place.
    noop: bool,
}

impl Plan {
    fn noop() -> Self {
        Self {
            noop: true,
            ..Self::default()
        }
    }
}

/// Entries an operation may leave in its staging slot.
const STAGED_ENTRIES: [&str; 3] = ["target", "source", "range"];

/// Path whose final state an operation is answerable for.
fn effect_path(op: &OperationRecord) -> Option<&Path> {
    let target = match op.kind {
        OpKind::Copy | OpKind::Move => op.targets.get(1),
        _ => op.targets.first(),
    };
    target.map(PathBuf::as_path)
}

/// A later operation touching the same path, an ancestor or a descendant
/// owns what ends up there.
fn superseded(op: &OperationRecord, later: &[&OperationEntry]) -> bool {
    let Some(path) = effect_path(op) else {
        return false;
    };
    later
        .iter()
        .flat_map(|entry| entry.record.targets.iter())
        .any(|target| target.starts_with(path) || path.starts_with(target))
}

/// Directories that would be created to hold `path`, deepest first.
fn missing_parents(path: &Path) -> Vec<PathBuf> {
    path.ancestors()
        .skip(1)
        .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
        .map(Path::to_path_buf)
        .collect()
}

pub struct TransactionManager {
    storage: Arc<dyn StorageOps>,
    wal: WriteAheadLog,
    locks: LockTable,
    live: DashMap<TransactionId, Arc<Mutex<Transaction>>>,
    finished: DashMap<TransactionId, TransactionState>,
    config: TransactionConfig,
}

impl TransactionManager {
    /// Open the WAL and rebuild every unfinished transaction in it.
    ///
    /// Transactions whose log already holds a terminal record are archived.
    /// The rest are registered as recovered: they hold their path locks and
    /// accept nothing but `prepare`, `commit` and `rollback`.
    pub async fn open(storage: Arc<dyn StorageOps>, config: TransactionConfig) -> AfsResult<Self> {
        let wal = WriteAheadLog::open(&config.wal_dir, config.archive_finished).await?;
        let manager = Self {
            storage,
            wal,
            locks: LockTable::new(),
            live: DashMap::new(),
            finished: DashMap::new(),
            config,
        };

        for (id, lines) in manager.wal.scan().await? {
            if lines.is_empty() {
                info!(transaction = %id, "discarding log without begin record");
                manager.wal.discard(id).await?;
                continue;
            }
            let record = TransactionRecord::replay(id, &lines)?;
            if record.state.is_terminal() {
                manager.wal.finish(id, record.state).await?;
                manager.finished.insert(id, record.state);
                continue;
            }
            for path in record.held_paths() {
                manager.locks.hold_in_doubt(id, &path);
            }
            info!(
                transaction = %id,
                state = %record.state,
                operations = record.operations.len(),
                decision = ?record.decision,
                "recovered in-doubt transaction"
            );
            let writer = manager.wal.reopen(id).await?;
            manager.live.insert(
                id,
                Arc::new(Mutex::new(Transaction {
                    record,
                    writer,
                    owner: None,
                    recovered: true,
                    last_activity: Instant::now(),
                })),
            );
        }

        let keep: HashSet<TransactionId> = manager.live.iter().map(|e| *e.key()).collect();
        manager.wal.remove_orphan_staging(&keep).await?;
        Ok(manager)
    }

    pub fn storage(&self) -> &Arc<dyn StorageOps> {
        &self.storage
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    fn entry(&self, id: TransactionId) -> Option<Arc<Mutex<Transaction>>> {
        self.live.get(&id).map(|e| Arc::clone(e.value()))
    }

    fn not_active(id: TransactionId) -> AfsError {
        AfsError::state(format!("transaction {id} is not active"))
    }

    async fn finished_outcome(&self, id: TransactionId) -> AfsResult<Option<TransactionState>> {
        if let Some(state) = self.finished.get(&id) {
            return Ok(Some(*state));
        }
        self.wal.archived_outcome(id).await
    }

    /// Current state, live or finished.
    pub async fn state(&self, id: TransactionId) -> AfsResult<Option<TransactionState>> {
        match self.entry(id) {
            Some(entry) => Ok(Some(entry.lock().await.record.state)),
            None => self.finished_outcome(id).await,
        }
    }

    /// Number of live transactions (recovered ones included).
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    // ========================================================================
    // Two-phase commit
    // ========================================================================

    /// Open a transaction on behalf of the coordinator.
    pub async fn begin(&self, id: TransactionId) -> AfsResult<()> {
        self.open_transaction(id, None).await
    }

    /// Open a transaction owned by `session`. Repeating the `begin` from the
    /// same session is a no-op; any other caller gets `DuplicateTransaction`.
    pub async fn begin_for(&self, id: TransactionId, session: &str) -> AfsResult<()> {
        self.open_transaction(id, Some(session)).await
    }

    /// Refuse `session` unless it began the live transaction `id`.
    /// Finished or unknown ids pass; the operation itself reports those.
    pub async fn check_owner(&self, id: TransactionId, session: &str) -> AfsResult<()> {
        let Some(entry) = self.entry(id) else {
            return Ok(());
        };
        let tx = entry.lock().await;
        if tx.owner.as_deref() == Some(session) {
            Ok(())
        } else {
            Err(AfsError::Forbidden(format!(
                "transaction {id} belongs to another session"
            )))
        }
    }

    #[instrument(skip(self), fields(transaction = %id))]
    async fn open_transaction(&self, id: TransactionId, owner: Option<&str>) -> AfsResult<()> {
        if let Some(entry) = self.entry(id) {
            let tx = entry.lock().await;
            let repeat = tx.record.state == TransactionState::Active
                && !tx.recovered
                && tx.owner.as_deref() == owner;
            return if repeat {
                Ok(())
            } else {
                Err(AfsError::DuplicateTransaction(id))
            };
        }
        if self.finished_outcome(id).await?.is_some() {
            return Err(AfsError::DuplicateTransaction(id));
        }
        if self.live.len() >= self.config.max_transactions {
            return Err(AfsError::TooManyTransactions(self.config.max_transactions));
        }

        let mut writer = self.wal.create(id).await?;
        let record = TransactionRecord::new(id, now_millis());
        let begin = WalRecord::Begin {
            transaction_id: id,
            created_at: record.created_at,
        };
        if let Err(e) = writer.append(&begin, true).await {
            drop(writer);
            if let Err(cleanup) = self.wal.discard(id).await {
                warn!(error = %cleanup, "could not remove log of failed begin");
            }
            return Err(e);
        }
        self.live.insert(
            id,
            Arc::new(Mutex::new(Transaction {
                record,
                writer,
                owner: owner.map(str::to_string),
                recovered: false,
                last_activity: Instant::now(),
            })),
        );
        info!("transaction begun");
        Ok(())
    }

    /// Execute one mutation. Returns whether anything changed on disk.
    ///
    /// On failure the operation is compensated and marked failed; the
    /// transaction stays ACTIVE.
    #[instrument(skip(self, op), fields(transaction = %id, kind = %op.kind()))]
    pub async fn execute(&self, id: TransactionId, op: Operation) -> AfsResult<bool> {
        let entry = self.entry(id).ok_or_else(|| Self::not_active(id))?;
        let mut tx = entry.lock().await;
        tx.ensure_accepting()?;
        tx.last_activity = Instant::now();

        if let Operation::Write { data, md5, .. } = &op {
            digest::verify(data, md5)?;
        }

        let timeout = self.config.lock_timeout();
        for path in op.exclusive_paths() {
            self.locks.acquire(id, path, LockMode::Exclusive, timeout).await?;
        }
        let shared = op.shared_path();
        if let Some(src) = shared {
            self.locks.acquire(id, src, LockMode::Shared, timeout).await?;
        }

        let result = self.execute_locked(&mut tx, &op).await;

        if let Some(src) = shared {
            self.locks.release_shared(id, src);
        }
        result
    }

    async fn execute_locked(&self, tx: &mut Transaction, op: &Operation) -> AfsResult<bool> {
        let id = tx.record.id;
        let seq = tx.record.next_seq();
        let sync = self.config.sync_operation_records;
        let plan = self.plan(id, seq, op).await?;

        let record = OperationRecord {
            transaction_id: id,
            seq,
            kind: op.kind(),
            targets: op.targets(),
            payload_digest: op.payload_digest(),
            range: op.range(),
            undo: plan.undo.clone(),
        };
        tx.log(WalRecord::Operation(record), sync).await?;

        match self.apply(op, &plan).await {
            Ok(changed) => {
                tx.log(WalRecord::Applied { seq }, sync).await?;
                debug!(seq, changed, "operation applied");
                Ok(changed)
            }
            Err(err) => {
                warn!(seq, error = %err, "operation failed, compensating");
                match self.run_undo(&plan.undo).await {
                    Ok(()) => {
                        tx.log(
                            WalRecord::Failed {
                                seq,
                                reason: err.to_string(),
                            },
                            sync,
                        )
                        .await?;
                    }
                    Err(undo_err) => {
                        // Left pending: prepare refuses it and rollback undoes it again.
                        error!(seq, error = %undo_err, "compensation failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn plan(&self, id: TransactionId, seq: u64, op: &Operation) -> AfsResult<Plan> {
        let slot = self.wal.staging_slot(id, seq);
        let storage = self.storage.as_ref();
        match op {
            Operation::Write {
                path, offset, data, ..
            } => match storage.stat(path).await? {
                Some(entry) if entry.is_dir() => Err(AfsError::NotAFile(path.display().to_string())),
                Some(entry) => {
                    let before = storage.read_range(path, *offset, data.len() as u64).await?;
                    let snapshot = slot.join("range");
                    storage.write_at(&snapshot, 0, &before).await?;
                    Ok(Plan {
                        undo: vec![UndoStep::RestoreRange {
                            path: path.clone(),
                            offset: *offset,
                            snapshot,
                            original_len: entry.size,
                        }],
                        ..Plan::default()
                    })
                }
                None => Ok(Plan {
                    undo: vec![
                        UndoStep::Remove { path: path.clone() },
                        UndoStep::RemoveEmptyDirs {
                            dirs: missing_parents(path),
                        },
                    ],
                    ..Plan::default()
                }),
            },
            Operation::Delete { path } => match storage.stat(path).await? {
                None => Ok(Plan::noop()),
                Some(_) => {
                    let staged = slot.join("target");
                    Ok(Plan {
                        undo: vec![UndoStep::Restore {
                            staged: staged.clone(),
                            original: path.clone(),
                        }],
                        stage_target: Some(staged),
                        ..Plan::default()
                    })
                }
            },
            Operation::Create { path, directory } => match storage.stat(path).await? {
                Some(entry) if entry.is_dir() == *directory => Ok(Plan::noop()),
                Some(_) => Err(AfsError::AlreadyExists(path.display().to_string())),
                None => Ok(Plan {
                    undo: vec![
                        UndoStep::Remove { path: path.clone() },
                        UndoStep::RemoveEmptyDirs {
                            dirs: missing_parents(path),
                        },
                    ],
                    ..Plan::default()
                }),
            },
            Operation::Copy { src, dst } => {
                if storage.stat(src).await?.is_none() {
                    return Err(AfsError::not_found(src.display().to_string()));
                }
                if dst.starts_with(src) {
                    return Err(AfsError::invalid_path(format!(
                        "cannot copy {} into itself",
                        src.display()
                    )));
                }
                let mut plan = Plan::default();
                self.plan_destination(&mut plan, &slot, dst, true).await?;
                Ok(plan)
            }
            Operation::Move {
                src,
                dst,
                across_shares,
            } => {
                let source = storage.stat(src).await?;
                let destination = storage.stat(dst).await?;
                if source.is_none() {
                    return match destination {
                        Some(_) => Ok(Plan::noop()),
                        None => Err(AfsError::not_found(src.display().to_string())),
                    };
                }
                if src == dst {
                    return Ok(Plan::noop());
                }
                if dst.starts_with(src) {
                    return Err(AfsError::invalid_path(format!(
                        "cannot move {} into itself",
                        src.display()
                    )));
                }
                let mut plan = Plan::default();
                if *across_shares {
                    let staged = slot.join("source");
                    plan.undo.push(UndoStep::Restore {
                        staged: staged.clone(),
                        original: src.clone(),
                    });
                    plan.stage_source = Some(staged);
                } else {
                    plan.undo.push(UndoStep::MoveBack {
                        from: dst.clone(),
                        to: src.clone(),
                    });
                }
                self.plan_destination(&mut plan, &slot, dst, *across_shares).await?;
                Ok(plan)
            }
        }
    }

    /// Undo for a copy/move destination: restore what was there, or remove
    /// what the operation put there. A same-share move needs no removal,
    /// since moving back clears the destination.
    async fn plan_destination(
        &self,
        plan: &mut Plan,
        slot: &Path,
        dst: &Path,
        remove_new: bool,
    ) -> AfsResult<()> {
        match self.storage.stat(dst).await? {
            Some(_) => {
                let staged = slot.join("target");
                plan.undo.push(UndoStep::Restore {
                    staged: staged.clone(),
                    original: dst.to_path_buf(),
                });
                plan.stage_target = Some(staged);
            }
            None => {
                if remove_new {
                    plan.undo.push(UndoStep::Remove {
                        path: dst.to_path_buf(),
                    });
                }
                plan.undo.push(UndoStep::RemoveEmptyDirs {
                    dirs: missing_parents(dst),
                });
            }
        }
        Ok(())
    }

    async fn apply(&self, op: &Operation, plan: &Plan) -> AfsResult<bool> {
        if plan.noop {
            return Ok(false);
        }
        let storage = self.storage.as_ref();
        match op {
            Operation::Write {
                path, offset, data, ..
            } => {
                storage.write_at(path, *offset, data).await?;
                Ok(true)
            }
            Operation::Delete { path } => match &plan.stage_target {
                Some(staged) => storage.move_path(path, staged).await,
                None => storage.delete(path).await,
            },
            Operation::Create { path, directory } => storage.create(path, *directory).await,
            Operation::Copy { src, dst } => {
                if let Some(staged) = &plan.stage_target {
                    storage.move_path(dst, staged).await?;
                }
                storage.copy(src, dst).await?;
                Ok(true)
            }
            Operation::Move { src, dst, .. } => {
                if let Some(staged) = &plan.stage_target {
                    storage.move_path(dst, staged).await?;
                }
                match &plan.stage_source {
                    Some(staged_source) => {
                        storage.copy(src, dst).await?;
                        let expected = storage.checksum(src).await?;
                        let actual = storage.checksum(dst).await?;
                        if expected != actual {
                            return Err(AfsError::ChecksumMismatch { expected, actual });
                        }
                        storage.move_path(src, staged_source).await?;
                        Ok(true)
                    }
                    None => storage.move_path(src, dst).await,
                }
            }
        }
    }

    async fn run_undo(&self, steps: &[UndoStep]) -> AfsResult<()> {
        for step in steps {
            step.apply(self.storage.as_ref()).await?;
        }
        Ok(())
    }

    async fn effect_visible(&self, op: &OperationRecord) -> AfsResult<bool> {
        let Some(target) = effect_path(op) else {
            return Ok(false);
        };
        let end = op.range.map_or(0, |(offset, len)| offset + len);
        let entry = self.storage.stat(target).await?;
        Ok(match op.kind {
            OpKind::Write => entry.is_some_and(|e| e.is_file() && e.size >= end),
            OpKind::Delete => entry.is_none(),
            OpKind::Create | OpKind::Copy | OpKind::Move => entry.is_some(),
            OpKind::List | OpKind::Read => true,
        })
    }

    /// Fix the outcome. `false` means an operation cannot be vouched for
    /// and the coordinator must roll back.
    #[instrument(skip(self), fields(transaction = %id))]
    pub async fn prepare(&self, id: TransactionId) -> AfsResult<bool> {
        let entry = self.entry(id).ok_or_else(|| Self::not_active(id))?;
        let mut tx = entry.lock().await;
        match tx.record.state {
            TransactionState::Prepared => return Ok(true),
            TransactionState::Active => {}
            state => return Err(AfsError::state(format!("transaction {id} is {state}"))),
        }
        if tx.record.decision.is_some() {
            return Err(AfsError::state(format!("transaction {id} is being finished")));
        }

        let ops: Vec<&OperationEntry> = tx
            .record
            .operations
            .iter()
            .filter(|op| !matches!(op.outcome, OpOutcome::Failed(_)))
            .collect();
        // Data paths plus the staging area: rollback after a crash reads
        // snapshots and staged entries back.
        let mut touched = BTreeSet::new();
        for (i, op) in ops.iter().enumerate() {
            if op.outcome == OpOutcome::Pending {
                warn!(seq = op.record.seq, "operation never completed, refusing prepare");
                return Ok(false);
            }
            if !superseded(&op.record, &ops[i + 1..]) && !self.effect_visible(&op.record).await? {
                warn!(seq = op.record.seq, "operation effect vanished, refusing prepare");
                return Ok(false);
            }
            for target in &op.record.targets {
                touched.insert(target.clone());
                if let Some(parent) = target.parent() {
                    touched.insert(parent.to_path_buf());
                }
            }
            let slot = self.wal.staging_slot(id, op.record.seq);
            for name in STAGED_ENTRIES {
                touched.insert(slot.join(name));
            }
            touched.insert(slot);
        }
        touched.insert(self.wal.staging_dir(id));
        for path in &touched {
            if self.storage.stat(path).await?.is_some() {
                self.storage.sync(path).await?;
            }
        }

        tx.log(WalRecord::Prepared { at: now_millis() }, true).await?;
        tx.last_activity = Instant::now();
        info!(operations = tx.record.operations.len(), "transaction prepared");
        Ok(true)
    }

    /// Finish a prepared transaction. Committing twice is a no-op.
    #[instrument(skip(self), fields(transaction = %id))]
    pub async fn commit(&self, id: TransactionId) -> AfsResult<()> {
        let Some(entry) = self.entry(id) else {
            return match self.finished_outcome(id).await? {
                Some(TransactionState::Committed) => Ok(()),
                Some(state) => Err(AfsError::state(format!("transaction {id} is {state}"))),
                None => Err(AfsError::state(format!("unknown transaction {id}"))),
            };
        };
        let mut tx = entry.lock().await;
        match tx.record.state {
            TransactionState::Committed => return Ok(()),
            TransactionState::Prepared => {}
            state => {
                return Err(AfsError::state(format!(
                    "transaction {id} is {state}, not PREPARED"
                )));
            }
        }
        match tx.record.decision {
            Some(Decision::Rollback) => {
                return Err(AfsError::state(format!("transaction {id} is rolling back")));
            }
            Some(Decision::Commit) => {}
            None => tx.log(WalRecord::Committing, true).await?,
        }

        let staging = self.wal.staging_dir(id);
        self.with_retry(id, "purge staging", || self.storage.delete(&staging))
            .await?;
        tx.log(WalRecord::Committed { at: now_millis() }, true).await?;
        self.finish(id, TransactionState::Committed).await;
        info!("transaction committed");
        Ok(())
    }

    /// Undo everything. Rolling back twice, or rolling back an unknown
    /// transaction, is a no-op.
    #[instrument(skip(self), fields(transaction = %id))]
    pub async fn rollback(&self, id: TransactionId) -> AfsResult<()> {
        let Some(entry) = self.entry(id) else {
            return match self.finished_outcome(id).await? {
                Some(TransactionState::Committed) => {
                    Err(AfsError::state(format!("transaction {id} is COMMITTED")))
                }
                _ => {
                    debug!("rollback of unknown or finished transaction");
                    Ok(())
                }
            };
        };
        let mut tx = entry.lock().await;
        match tx.record.state {
            TransactionState::RolledBack => return Ok(()),
            TransactionState::Committed => {
                return Err(AfsError::state(format!("transaction {id} is COMMITTED")));
            }
            TransactionState::Active | TransactionState::Prepared => {}
        }
        match tx.record.decision {
            Some(Decision::Commit) => {
                return Err(AfsError::state(format!("transaction {id} is committing")));
            }
            Some(Decision::Rollback) => {}
            None => tx.log(WalRecord::RollingBack, true).await?,
        }

        let pending: Vec<(u64, Vec<UndoStep>)> = tx
            .record
            .operations
            .iter()
            .rev()
            .filter(|op| !op.undone && !matches!(op.outcome, OpOutcome::Failed(_)))
            .map(|op| (op.record.seq, op.record.undo.clone()))
            .collect();
        for (seq, steps) in pending {
            for step in &steps {
                self.with_retry(id, "undo", || step.apply(self.storage.as_ref()))
                    .await?;
            }
            tx.log(WalRecord::Undone { seq }, true).await?;
        }

        let staging = self.wal.staging_dir(id);
        self.with_retry(id, "purge staging", || self.storage.delete(&staging))
            .await?;
        tx.log(WalRecord::RolledBack { at: now_millis() }, true).await?;
        self.finish(id, TransactionState::RolledBack).await;
        info!("transaction rolled back");
        Ok(())
    }

    async fn finish(&self, id: TransactionId, state: TransactionState) {
        self.locks.release_all(id);
        self.finished.insert(id, state);
        self.live.remove(&id);
        if let Err(e) = self.wal.finish(id, state).await {
            warn!(transaction = %id, error = %e, "could not archive finished log");
        }
    }

    async fn with_retry<T, F, Fut>(&self, id: TransactionId, what: &str, f: F) -> AfsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AfsResult<T>>,
    {
        let retry = &self.config.retry;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(retry.min_delay_ms))
            .with_max_delay(Duration::from_millis(retry.max_delay_ms))
            .with_max_times(retry.max_attempts.saturating_sub(1));
        f.retry(backoff)
            .sleep(tokio::time::sleep)
            .when(AfsError::is_transient)
            .notify(|err: &AfsError, delay: Duration| {
                warn!(transaction = %id, what, error = %err, ?delay, "retrying");
            })
            .await
            .map_err(|err| {
                error!(
                    transaction = %id,
                    what,
                    error = %err,
                    "retries exhausted, transaction needs operator attention"
                );
                AfsError::Integrity {
                    transaction: id,
                    reason: format!("{what}: {err}"),
                }
            })
    }

    /// Transactions the coordinator must decide: everything recovered at
    /// startup, every PREPARED one, and any stuck mid-finish.
    pub async fn recover(&self) -> Vec<TransactionId> {
        let entries: Vec<_> = self
            .live
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        let mut in_doubt = Vec::new();
        for (id, entry) in entries {
            let tx = entry.lock().await;
            if tx.recovered
                || tx.record.state == TransactionState::Prepared
                || tx.record.decision.is_some()
            {
                in_doubt.push(id);
            }
        }
        in_doubt.sort();
        in_doubt
    }

    /// ACTIVE transactions idle longer than the transaction timeout.
    /// Advisory: nothing is rolled back here.
    pub fn expired(&self, now: Instant) -> Vec<TransactionId> {
        let timeout = self.config.transaction_timeout();
        let mut expired: Vec<_> = self
            .live
            .iter()
            .filter_map(|e| {
                let tx = e.value().try_lock().ok()?;
                let idle = now.saturating_duration_since(tx.last_activity);
                (tx.record.state == TransactionState::Active && !tx.recovered && idle > timeout)
                    .then_some(*e.key())
            })
            .collect();
        expired.sort();
        expired
    }

    // ========================================================================
    // Reads (not logged)
    // ========================================================================

    /// Read under a shared lock held by `owner` for the duration of the read.
    pub async fn read(
        &self,
        owner: TransactionId,
        path: &Path,
        offset: u64,
        limit: u64,
    ) -> AfsResult<Vec<u8>> {
        self.locks
            .acquire(owner, path, LockMode::Shared, self.config.lock_timeout())
            .await?;
        let result = self.storage.read(path, offset, limit).await;
        self.locks.release_shared(owner, path);
        result
    }

    /// One page of a listing, resuming after `after`.
    pub async fn list(
        &self,
        owner: TransactionId,
        path: &Path,
        recursive: bool,
        after: Option<PathBuf>,
        limit: Option<usize>,
    ) -> AfsResult<Vec<Entry>> {
        self.locks
            .acquire(owner, path, LockMode::Shared, self.config.lock_timeout())
            .await?;
        let result = async {
            let mut listing = self.storage.listing(path, recursive).await?;
            if let Some(after) = after {
                listing = listing.resume_after(after);
            }
            match limit {
                Some(limit) => listing.take(limit).await,
                None => listing.collect().await,
            }
        }
        .await;
        self.locks.release_shared(owner, path);
        result
    }

    pub async fn free(&self, path: &Path) -> AfsResult<FreeSpace> {
        self.storage.free(path).await
    }
}

#[async_trait]
impl Coordinator for TransactionManager {
    async fn begin(&self, id: TransactionId) -> AfsResult<()> {
        TransactionManager::begin(self, id).await
    }

    async fn prepare(&self, id: TransactionId) -> AfsResult<bool> {
        TransactionManager::prepare(self, id).await
    }

    async fn commit(&self, id: TransactionId) -> AfsResult<()> {
        TransactionManager::commit(self, id).await
    }

    async fn rollback(&self, id: TransactionId) -> AfsResult<()> {
        TransactionManager::rollback(self, id).await
    }

    async fn recover(&self) -> AfsResult<Vec<TransactionId>> {
        Ok(TransactionManager::recover(self).await)
    }
}
