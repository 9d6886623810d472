//! Per-session worker.
//!
//! A worker binds at most one transaction at a time. Data operations issued
//! while nothing is bound run as a single-operation autocommit transaction,
//! so no mutation ever happens outside a transaction.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use afs_types::{FreeSpace, TransactionId};
use tracing::{debug, warn};

use crate::error::{AfsError, AfsResult};
use crate::storage::Entry;
use crate::transaction::{Operation, TransactionManager};

pub struct Worker {
    session: String,
    manager: Arc<TransactionManager>,
    transaction: Option<TransactionId>,
}

impl Worker {
    pub fn new(session: impl Into<String>, manager: Arc<TransactionManager>) -> Self {
        Self {
            session: session.into(),
            manager,
            transaction: None,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Transaction currently bound to this session.
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    fn bound(&self) -> AfsResult<TransactionId> {
        self.transaction
            .ok_or_else(|| AfsError::state("no transaction bound to this session"))
    }

    /// Bound transaction, provided this session still owns it.
    async fn owned(&self) -> AfsResult<TransactionId> {
        let id = self.bound()?;
        self.manager.check_owner(id, &self.session).await?;
        Ok(id)
    }

    /// Forget a bound transaction that was finished elsewhere, e.g. by the
    /// coordinator by id.
    async fn drop_finished_binding(&mut self) -> AfsResult<()> {
        let Some(id) = self.transaction else {
            return Ok(());
        };
        let finished = match self.manager.state(id).await? {
            Some(state) => state.is_terminal(),
            None => true,
        };
        if finished {
            debug!(session = %self.session, transaction = %id, "bound transaction already finished");
            self.transaction = None;
        }
        Ok(())
    }

    // ========================================================================
    // Transaction control
    // ========================================================================

    pub async fn begin(&mut self, id: TransactionId) -> AfsResult<()> {
        self.drop_finished_binding().await?;
        if let Some(current) = self.transaction {
            if current != id {
                return Err(AfsError::state(format!(
                    "session already bound to transaction {current}"
                )));
            }
        }
        self.manager.begin_for(id, &self.session).await?;
        self.transaction = Some(id);
        Ok(())
    }

    pub async fn prepare(&mut self) -> AfsResult<bool> {
        let id = self.owned().await?;
        self.manager.prepare(id).await
    }

    pub async fn commit(&mut self) -> AfsResult<()> {
        let id = self.owned().await?;
        self.manager.commit(id).await?;
        self.transaction = None;
        Ok(())
    }

    pub async fn rollback(&mut self) -> AfsResult<()> {
        let id = self.owned().await?;
        self.manager.rollback(id).await?;
        self.transaction = None;
        Ok(())
    }

    /// Finish a transaction by id, e.g. one recovered after a restart.
    pub async fn commit_transaction(&mut self, id: TransactionId) -> AfsResult<()> {
        self.manager.commit(id).await?;
        self.unbind(id);
        Ok(())
    }

    pub async fn rollback_transaction(&mut self, id: TransactionId) -> AfsResult<()> {
        self.manager.rollback(id).await?;
        self.unbind(id);
        Ok(())
    }

    pub async fn prepare_transaction(&mut self, id: TransactionId) -> AfsResult<bool> {
        self.manager.prepare(id).await
    }

    pub async fn recover(&self) -> Vec<TransactionId> {
        self.manager.recover().await
    }

    fn unbind(&mut self, id: TransactionId) {
        if self.transaction == Some(id) {
            self.transaction = None;
        }
    }

    // ========================================================================
    // Data operations
    // ========================================================================

    /// Run a mutation in the bound transaction, or autocommit it.
    pub async fn execute(&mut self, op: Operation) -> AfsResult<bool> {
        self.drop_finished_binding().await?;
        if self.transaction.is_some() {
            let id = self.owned().await?;
            return self.manager.execute(id, op).await;
        }
        self.autocommit(op).await
    }

    async fn autocommit(&self, op: Operation) -> AfsResult<bool> {
        let id = TransactionId::random();
        let target = op.targets().pop().unwrap_or_default();
        debug!(session = %self.session, transaction = %id, kind = %op.kind(), "autocommit");
        self.manager.begin_for(id, &self.session).await?;

        let result = async {
            let changed = self.manager.execute(id, op).await?;
            if !self.manager.prepare(id).await? {
                return Err(AfsError::StorageIo {
                    path: target.display().to_string(),
                    source: io::Error::other("operation could not be prepared"),
                });
            }
            self.manager.commit(id).await?;
            Ok(changed)
        }
        .await;

        if result.is_err() {
            if let Err(e) = self.manager.rollback(id).await {
                warn!(transaction = %id, error = %e, "autocommit rollback failed");
            }
        }
        result
    }

    /// Lock owner for reads: the bound transaction sees its own writes.
    fn reader(&self) -> TransactionId {
        self.transaction.unwrap_or_else(TransactionId::random)
    }

    pub async fn read(&self, path: &Path, offset: u64, limit: u64) -> AfsResult<Vec<u8>> {
        self.manager.read(self.reader(), path, offset, limit).await
    }

    pub async fn list(
        &self,
        path: &Path,
        recursive: bool,
        after: Option<PathBuf>,
        limit: Option<usize>,
    ) -> AfsResult<Vec<Entry>> {
        self.manager
            .list(self.reader(), path, recursive, after, limit)
            .await
    }

    pub async fn free(&self, path: &Path) -> AfsResult<FreeSpace> {
        self.manager.free(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionConfig;
    use crate::storage::{LocalStorage, digest};
    use afs_types::TransactionState;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<TransactionManager>) {
        let dir = TempDir::new().unwrap();
        let config = TransactionConfig::new(dir.path().join("wal"))
            .with_lock_timeout(Duration::from_millis(100));
        let manager = TransactionManager::open(Arc::new(LocalStorage::new()), config)
            .await
            .unwrap();
        (dir, Arc::new(manager))
    }

    fn write(path: PathBuf, data: &[u8]) -> Operation {
        Operation::Write {
            path,
            offset: 0,
            data: data.to_vec(),
            md5: digest::md5_hex(data),
        }
    }

    #[tokio::test]
    async fn test_autocommit_when_unbound() {
        let (dir, manager) = setup().await;
        let mut worker = Worker::new("s1", Arc::clone(&manager));
        let path = dir.path().join("data/f");

        assert!(worker.execute(write(path.clone(), b"auto")).await.unwrap());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"auto");
        assert_eq!(manager.live_count(), 0);
        assert!(worker.transaction().is_none());
    }

    #[tokio::test]
    async fn test_autocommit_failure_leaves_nothing() {
        let (dir, manager) = setup().await;
        let mut worker = Worker::new("s1", Arc::clone(&manager));
        let result = worker
            .execute(Operation::Copy {
                src: dir.path().join("missing"),
                dst: dir.path().join("copy"),
            })
            .await;
        assert!(matches!(result, Err(AfsError::NotFound(_))));
        assert!(!dir.path().join("copy").exists());
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_bound_transaction() {
        let (dir, manager) = setup().await;
        let mut worker = Worker::new("s1", Arc::clone(&manager));
        let id = TransactionId::random();
        let path = dir.path().join("f");

        worker.begin(id).await.unwrap();
        assert!(worker.begin(TransactionId::random()).await.is_err());
        worker.execute(write(path.clone(), b"bound")).await.unwrap();
        // Reads inside the transaction are not blocked by its own writes.
        assert_eq!(worker.read(&path, 0, 100).await.unwrap(), b"bound");

        assert!(worker.prepare().await.unwrap());
        worker.commit().await.unwrap();
        assert!(worker.transaction().is_none());
        assert_eq!(
            manager.state(id).await.unwrap(),
            Some(TransactionState::Committed)
        );
        assert!(matches!(worker.commit().await, Err(AfsError::TransactionState(_))));
    }

    #[tokio::test]
    async fn test_rollback_by_id_unbinds() {
        let (dir, manager) = setup().await;
        let mut worker = Worker::new("s1", manager);
        let id = TransactionId::random();
        worker.begin(id).await.unwrap();
        worker.execute(write(dir.path().join("f"), b"x")).await.unwrap();

        worker.rollback_transaction(id).await.unwrap();
        assert!(worker.transaction().is_none());
        assert!(!dir.path().join("f").exists());
    }

    #[tokio::test]
    async fn test_other_session_cannot_join() {
        let (dir, manager) = setup().await;
        let mut owner = Worker::new("s1", Arc::clone(&manager));
        let mut intruder = Worker::new("s2", Arc::clone(&manager));
        let id = TransactionId::random();

        owner.begin(id).await.unwrap();
        owner.begin(id).await.unwrap();
        owner.execute(write(dir.path().join("mine"), b"x")).await.unwrap();

        assert!(matches!(
            intruder.begin(id).await,
            Err(AfsError::DuplicateTransaction(_))
        ));
        assert!(intruder.transaction().is_none());
        assert!(matches!(
            intruder.rollback().await,
            Err(AfsError::TransactionState(_))
        ));

        assert!(owner.prepare().await.unwrap());
        owner.commit().await.unwrap();
        assert!(dir.path().join("mine").exists());
    }

    #[tokio::test]
    async fn test_foreign_binding_is_refused() {
        let (dir, manager) = setup().await;
        let id = TransactionId::random();
        manager.begin_for(id, "s1").await.unwrap();

        // Bound without going through begin, as after a session mix-up.
        let mut other = Worker::new("s2", Arc::clone(&manager));
        other.transaction = Some(id);
        assert!(matches!(
            other.execute(write(dir.path().join("evil"), b"x")).await,
            Err(AfsError::Forbidden(_))
        ));
        assert!(matches!(other.rollback().await, Err(AfsError::Forbidden(_))));
        assert!(!dir.path().join("evil").exists());
        assert_eq!(manager.state(id).await.unwrap(), Some(TransactionState::Active));
    }

    #[tokio::test]
    async fn test_binding_cleared_after_coordinator_finishes() {
        let (dir, manager) = setup().await;
        let mut worker = Worker::new("s1", Arc::clone(&manager));
        let first = TransactionId::random();
        worker.begin(first).await.unwrap();
        worker.execute(write(dir.path().join("a"), b"1")).await.unwrap();

        // The coordinator decides from its own session.
        assert!(manager.prepare(first).await.unwrap());
        manager.commit(first).await.unwrap();

        let second = TransactionId::random();
        worker.begin(second).await.unwrap();
        assert_eq!(worker.transaction(), Some(second));
        worker.execute(write(dir.path().join("b"), b"2")).await.unwrap();
        worker.rollback().await.unwrap();

        // Without a new begin, data operations fall back to autocommit.
        let third = TransactionId::random();
        worker.begin(third).await.unwrap();
        manager.rollback(third).await.unwrap();
        worker.execute(write(dir.path().join("c"), b"3")).await.unwrap();
        assert!(worker.transaction().is_none());
        assert!(dir.path().join("c").exists());
        assert!(!dir.path().join("b").exists());
    }
}
