//! Server configuration.
//!
//! One TOML file, every field defaulted, so an empty file is a valid
//! single-share development setup:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8085"
//! interactive_session_key = "change-me"
//! transaction_manager_key = "change-me-too"
//!
//! [storage]
//! root = "/srv/afs/store"
//! storage_uuid = "8A1E5D9C-3B1F-4E2A-9D41-2C7F0E6B8A11"
//! allocation = "most-free-space"
//!
//! [transactions]
//! wal_dir = "/srv/afs/wal"
//! max_transactions = 256
//!
//! [[auth.users]]
//! name = "admin"
//! password = "secret"
//!
//! [[owners.entries]]
//! perm_id = "20240101-7"
//! kind = "data_set"
//! share_id = "2"
//! location = "8A1E5D9C/ab/cd/20240101-7"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use afs_types::OwnerKind;
use serde::{Deserialize, Serialize};

use crate::error::{AfsError, AfsResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AfsConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub transactions: TransactionConfig,
    pub auth: AuthConfig,
    pub owners: OwnersConfig,
}

/// `[server]`: network surface and session policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the JSON-lines endpoint.
    pub bind: String,
    /// Clients presenting this key get interactive (multi-call) sessions.
    pub interactive_session_key: String,
    /// Required for `recover` and for finishing transactions by id.
    pub transaction_manager_key: String,
    /// Idle workers are dropped after this many seconds.
    pub worker_idle_timeout_secs: u64,
    /// Largest accepted request line.
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8085".to_string(),
            interactive_session_key: "interactive-session-key".to_string(),
            transaction_manager_key: "transaction-manager-key".to_string(),
            worker_idle_timeout_secs: 600,
            max_request_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }
}

/// Where new owners are placed when no share holds them yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationPolicy {
    /// First share in enumeration order.
    #[default]
    FirstShare,
    /// Share with the most free bytes; ties go to the earlier share.
    MostFreeSpace,
}

/// `[storage]`: the share layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory whose subdirectories are the shares.
    pub root: PathBuf,
    /// Top-level directory inside each share.
    pub storage_uuid: String,
    /// Number of two-hex-digit shard directories between uuid and owner.
    pub shard_levels: usize,
    pub allocation: AllocationPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("store"),
            storage_uuid: "afs".to_string(),
            shard_levels: 3,
            allocation: AllocationPolicy::FirstShare,
        }
    }
}

impl StorageConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_allocation(mut self, allocation: AllocationPolicy) -> Self {
        self.allocation = allocation;
        self
    }
}

/// Backoff bounds for commit/rollback replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

/// `[transactions]`: WAL location and participant limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub wal_dir: PathBuf,
    pub max_transactions: usize,
    /// ACTIVE transactions idle this long are reported as expired.
    pub transaction_timeout_secs: u64,
    pub lock_timeout_ms: u64,
    /// Keep finished logs under `archive/` instead of deleting them.
    pub archive_finished: bool,
    /// fsync every operation record, not only the outcome records.
    pub sync_operation_records: bool,
    pub retry: RetryConfig,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("wal"),
            max_transactions: 128,
            transaction_timeout_secs: 3600,
            lock_timeout_ms: 5_000,
            archive_finished: true,
            sync_operation_records: false,
            retry: RetryConfig::default(),
        }
    }
}

impl TransactionConfig {
    /// Defaults with the WAL under `wal_dir`.
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_transactions(mut self, max: usize) -> Self {
        self.max_transactions = max;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive_finished = archive;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

/// One login accepted by the in-memory authenticator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub password: String,
}

/// `[auth]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<UserEntry>,
}

/// One owner known to the static owner directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub perm_id: String,
    pub kind: OwnerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// `[owners]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnersConfig {
    /// Treat unlisted owners as samples without assigned storage.
    pub accept_unknown: bool,
    pub entries: Vec<OwnerEntry>,
}

impl AfsConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> AfsResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AfsError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml(text: &str) -> AfsResult<Self> {
        toml::from_str(text).map_err(|e| AfsError::Config(e.to_string()))
    }

    /// Check the invariants the server relies on.
    pub fn validate(&self) -> AfsResult<()> {
        if self.server.interactive_session_key.is_empty() {
            return Err(AfsError::Config("interactive_session_key is empty".into()));
        }
        if self.server.transaction_manager_key.is_empty() {
            return Err(AfsError::Config("transaction_manager_key is empty".into()));
        }
        if self.server.interactive_session_key == self.server.transaction_manager_key {
            return Err(AfsError::Config(
                "interactive_session_key and transaction_manager_key must differ".into(),
            ));
        }
        if self.server.worker_idle_timeout_secs == 0 {
            return Err(AfsError::Config("worker_idle_timeout_secs must be positive".into()));
        }
        if self.transactions.lock_timeout_ms == 0 || self.transactions.transaction_timeout_secs == 0
        {
            return Err(AfsError::Config("transaction timeouts must be positive".into()));
        }
        if self.transactions.max_transactions == 0 {
            return Err(AfsError::Config("max_transactions must be positive".into()));
        }
        if self.storage.storage_uuid.is_empty() || self.storage.storage_uuid.contains('/') {
            return Err(AfsError::Config(format!(
                "bad storage_uuid: {:?}",
                self.storage.storage_uuid
            )));
        }
        if self.storage.shard_levels > 16 {
            return Err(AfsError::Config("shard_levels must be at most 16".into()));
        }
        if !self.storage.root.is_dir() {
            return Err(AfsError::Config(format!(
                "storage root {} is not a directory",
                self.storage.root.display()
            )));
        }
        for owner in &self.owners.entries {
            if owner.share_id.is_some() != owner.location.is_some() {
                return Err(AfsError::Config(format!(
                    "owner {} needs both share_id and location, or neither",
                    owner.perm_id
                )));
            }
        }
        Ok(())
    }
}
