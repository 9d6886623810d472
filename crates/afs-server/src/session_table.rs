//! Session token → worker.
//!
//! Entries are created on login and dropped on logout or after sitting idle.
//! Dropping a worker never touches its transaction: whatever it had bound
//! stays registered with the transaction manager for the coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use afs_engine::{AfsError, AfsResult, Proxy};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

/// One session's worker plus its idle clock.
#[derive(Clone)]
pub struct WorkerHandle {
    proxy: Arc<Mutex<Proxy>>,
    last_used: Arc<parking_lot::Mutex<Instant>>,
}

impl WorkerHandle {
    pub fn new(proxy: Proxy) -> Self {
        Self {
            proxy: Arc::new(Mutex::new(proxy)),
            last_used: Arc::new(parking_lot::Mutex::new(Instant::now())),
        }
    }

    /// Take the worker for one operation. A second concurrent operation on
    /// the same session is refused, not queued.
    pub fn checkout(&self) -> AfsResult<OwnedMutexGuard<Proxy>> {
        let guard = Arc::clone(&self.proxy)
            .try_lock_owned()
            .map_err(|_| AfsError::SessionBusy)?;
        *self.last_used.lock() = Instant::now();
        Ok(guard)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }

    fn is_busy(&self) -> bool {
        self.proxy.try_lock().is_err()
    }
}

#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<String, WorkerHandle>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: String, handle: WorkerHandle) {
        self.sessions.insert(token, handle);
    }

    pub fn get(&self, token: &str) -> AfsResult<WorkerHandle> {
        self.sessions
            .get(token)
            .map(|h| h.value().clone())
            .ok_or(AfsError::InvalidSession)
    }

    pub fn remove(&self, token: &str) -> Option<WorkerHandle> {
        self.sessions.remove(token).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle longer than `timeout`. Returns their tokens.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut removed = Vec::new();
        self.sessions.retain(|token, handle| {
            let keep = handle.is_busy() || handle.idle_for(now) <= timeout;
            if !keep {
                removed.push(token.clone());
            }
            keep
        });
        for token in &removed {
            info!(session = %token, "dropped idle session");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afs_engine::{
        InMemoryAuthenticator, LocalStorage, PathResolver, StaticOwnerDirectory, StorageConfig,
        TransactionConfig, TransactionManager, Worker,
    };
    use tempfile::TempDir;

    async fn handle(dir: &TempDir, token: &str) -> WorkerHandle {
        let store = dir.path().join("store");
        std::fs::create_dir_all(store.join("1")).unwrap();
        let resolver = PathResolver::from_config(
            &StorageConfig::default().with_root(&store),
            Arc::new(StaticOwnerDirectory::new()),
        )
        .await
        .unwrap();
        let manager = TransactionManager::open(
            Arc::new(LocalStorage::new()),
            TransactionConfig::new(dir.path().join(format!("wal-{token}"))),
        )
        .await
        .unwrap();
        WorkerHandle::new(Proxy::new(
            token,
            Arc::new(InMemoryAuthenticator::new()),
            Arc::new(resolver),
            Worker::new(token, Arc::new(manager)),
        ))
    }

    #[tokio::test]
    async fn test_second_checkout_is_busy() {
        let dir = TempDir::new().unwrap();
        let table = SessionTable::new();
        table.insert("t".into(), handle(&dir, "t").await);

        let handle = table.get("t").unwrap();
        let guard = handle.checkout().unwrap();
        assert!(matches!(handle.checkout(), Err(AfsError::SessionBusy)));
        drop(guard);
        handle.checkout().unwrap();

        assert!(matches!(table.get("nope"), Err(AfsError::InvalidSession)));
    }

    #[tokio::test]
    async fn test_sweep_skips_busy_and_recent() {
        let dir = TempDir::new().unwrap();
        let table = SessionTable::new();
        table.insert("idle".into(), handle(&dir, "idle").await);
        table.insert("busy".into(), handle(&dir, "busy").await);

        let busy = table.get("busy").unwrap();
        let _guard = busy.checkout().unwrap();

        let timeout = Duration::from_secs(60);
        assert!(table.sweep(Instant::now(), timeout).is_empty());

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(table.sweep(later, timeout), vec!["idle".to_string()]);
        assert_eq!(table.len(), 1);
    }
}
