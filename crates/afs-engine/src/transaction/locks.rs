//! Hierarchical path locks.
//!
//! A lock on a path covers everything below it, so two locks conflict when
//! one path is an ancestor of (or equal to) the other and at least one of
//! them is exclusive. Locks held by recovered transactions are marked
//! in-doubt; running into one fails immediately instead of waiting, since
//! only the coordinator can release it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use afs_types::TransactionId;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{AfsError, AfsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct PathLock {
    exclusive: Option<TransactionId>,
    shared: HashMap<TransactionId, usize>,
}

impl PathLock {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockState {
    paths: HashMap<PathBuf, PathLock>,
    in_doubt: HashSet<TransactionId>,
}

impl LockState {
    fn conflict(&self, owner: TransactionId, path: &Path, mode: LockMode) -> Option<TransactionId> {
        for (held, lock) in &self.paths {
            if !(held.starts_with(path) || path.starts_with(held)) {
                continue;
            }
            if let Some(holder) = lock.exclusive.filter(|h| *h != owner) {
                return Some(holder);
            }
            if mode == LockMode::Exclusive {
                if let Some(reader) = lock.shared.keys().find(|r| **r != owner) {
                    return Some(*reader);
                }
            }
        }
        None
    }

    fn grant(&mut self, owner: TransactionId, path: &Path, mode: LockMode) {
        let lock = self.paths.entry(path.to_path_buf()).or_default();
        match mode {
            LockMode::Exclusive => lock.exclusive = Some(owner),
            LockMode::Shared => *lock.shared.entry(owner).or_default() += 1,
        }
    }
}

/// Path lock table shared by every transaction of a manager.
#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    released: Notify,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock, waiting up to `timeout` for conflicting holders.
    pub async fn acquire(
        &self,
        owner: TransactionId,
        path: &Path,
        mode: LockMode,
        timeout: Duration,
    ) -> AfsResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            {
                let mut state = self.state.lock();
                match state.conflict(owner, path, mode) {
                    None => {
                        state.grant(owner, path, mode);
                        trace!(transaction = %owner, path = %path.display(), ?mode, "lock granted");
                        return Ok(());
                    }
                    Some(holder) if state.in_doubt.contains(&holder) => {
                        return Err(AfsError::InDoubt {
                            path: path.display().to_string(),
                            transaction: holder,
                        });
                    }
                    Some(holder) => {
                        debug!(transaction = %owner, %holder, path = %path.display(), "waiting for lock");
                    }
                }
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(AfsError::LockTimeout(path.display().to_string()));
            }
        }
    }

    /// Lock a path for a recovered transaction without waiting.
    pub fn hold_in_doubt(&self, owner: TransactionId, path: &Path) {
        let mut state = self.state.lock();
        state.in_doubt.insert(owner);
        state.grant(owner, path, LockMode::Exclusive);
    }

    /// Drop one shared hold.
    pub fn release_shared(&self, owner: TransactionId, path: &Path) {
        let mut state = self.state.lock();
        if let Some(lock) = state.paths.get_mut(path) {
            if let Some(count) = lock.shared.get_mut(&owner) {
                *count -= 1;
                if *count == 0 {
                    lock.shared.remove(&owner);
                }
            }
            if lock.is_free() {
                state.paths.remove(path);
            }
        }
        drop(state);
        self.released.notify_waiters();
    }

    /// Drop everything `owner` holds.
    pub fn release_all(&self, owner: TransactionId) {
        let mut state = self.state.lock();
        state.paths.retain(|_, lock| {
            if lock.exclusive == Some(owner) {
                lock.exclusive = None;
            }
            lock.shared.remove(&owner);
            !lock.is_free()
        });
        state.in_doubt.remove(&owner);
        drop(state);
        self.released.notify_waiters();
    }

    /// Whether anything is locked at or below/above `path`.
    pub fn is_locked(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state
            .paths
            .keys()
            .any(|held| held.starts_with(path) || path.starts_with(held))
    }
}
