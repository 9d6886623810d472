//! AFS error types.
//!
//! Every error carries a boundary class so the RPC layer can tell a client
//! whether to give up, retry, or ask about the transaction's fate.

use std::io;
use std::path::Path;

use afs_types::TransactionId;
use thiserror::Error;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request itself is wrong. Retrying it unchanged will fail again.
    Rejected,
    /// The request may succeed later (transient I/O, lock contention).
    Retryable,
    /// The outcome was not durably recorded; query transaction status.
    OutcomeUnknown,
}

/// AFS error type.
#[derive(Debug, Error)]
pub enum AfsError {
    /// Owner is not known to the metadata server.
    #[error("unknown owner: {0}")]
    UnknownOwner(String),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Read offset outside the file.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Payload does not match the digest sent with it.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Transaction id already in use.
    #[error("duplicate transaction: {0}")]
    DuplicateTransaction(TransactionId),

    /// Operation is not valid in the transaction's current state.
    #[error("invalid transaction state: {0}")]
    TransactionState(String),

    /// Disk or filesystem failure.
    #[error("storage I/O error on {path}: {source}")]
    StorageIo {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The WAL could not record an outcome.
    #[error("WAL durability failure: {0}")]
    WalDurability(String),

    /// Relative path is malformed or leaves the owner directory.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Path already exists with a different kind.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a file.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Path is held by a recovered transaction awaiting the coordinator.
    #[error("{path} is held by in-doubt transaction {transaction}")]
    InDoubt {
        path: String,
        transaction: TransactionId,
    },

    /// Gave up waiting for a path lock.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Session already has an operation in flight.
    #[error("session busy")]
    SessionBusy,

    /// Session token missing, expired, or logged out.
    #[error("invalid session")]
    InvalidSession,

    /// Caller lacks the key a method requires.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed request at the RPC boundary.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Live transaction limit reached.
    #[error("too many transactions (limit {0})")]
    TooManyTransactions(usize),

    /// Commit or rollback replay exhausted its retries.
    #[error("integrity failure in transaction {transaction}: {reason}")]
    Integrity {
        transaction: TransactionId,
        reason: String,
    },

    /// Configuration problem.
    #[error("config error: {0}")]
    Config(String),
}

impl AfsError {
    /// Map an I/O error on `path`. `NotFound` keeps its own variant.
    pub fn io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            _ => Self::StorageIo {
                path: path.display().to_string(),
                source: err,
            },
        }
    }

    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a TransactionState error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::TransactionState(msg.into())
    }

    /// Create a WalDurability error.
    pub fn wal(msg: impl Into<String>) -> Self {
        Self::WalDurability(msg.into())
    }

    /// Boundary class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownOwner(_)
            | Self::NotFound(_)
            | Self::InvalidRange(_)
            | Self::ChecksumMismatch { .. }
            | Self::DuplicateTransaction(_)
            | Self::TransactionState(_)
            | Self::InvalidPath(_)
            | Self::AlreadyExists(_)
            | Self::NotAFile(_)
            | Self::InvalidSession
            | Self::Forbidden(_)
            | Self::InvalidRequest(_) => ErrorClass::Rejected,
            Self::StorageIo { .. }
            | Self::Config(_)
            | Self::InDoubt { .. }
            | Self::LockTimeout(_)
            | Self::SessionBusy
            | Self::TooManyTransactions(_) => ErrorClass::Retryable,
            Self::WalDurability(_) | Self::Integrity { .. } => ErrorClass::OutcomeUnknown,
        }
    }

    /// HTTP-style status code for the RPC boundary.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRange(_)
            | Self::ChecksumMismatch { .. }
            | Self::InvalidPath(_)
            | Self::NotAFile(_)
            | Self::InvalidRequest(_) => 400,
            Self::InvalidSession => 401,
            Self::Forbidden(_) => 403,
            Self::UnknownOwner(_) | Self::NotFound(_) => 404,
            Self::DuplicateTransaction(_)
            | Self::TransactionState(_)
            | Self::AlreadyExists(_)
            | Self::SessionBusy => 409,
            Self::InDoubt { .. } => 423,
            Self::StorageIo { source, .. } if is_disk_full(source) => 507,
            Self::StorageIo { .. } | Self::Config(_) => 500,
            Self::LockTimeout(_) | Self::TooManyTransactions(_) => 503,
            Self::WalDurability(_) | Self::Integrity { .. } => 500,
        }
    }

    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownOwner(_) => "unknown_owner",
            Self::NotFound(_) => "not_found",
            Self::InvalidRange(_) => "invalid_range",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::DuplicateTransaction(_) => "duplicate_transaction",
            Self::TransactionState(_) => "transaction_state",
            Self::StorageIo { .. } => "storage_io",
            Self::WalDurability(_) => "wal_durability",
            Self::InvalidPath(_) => "invalid_path",
            Self::AlreadyExists(_) => "already_exists",
            Self::NotAFile(_) => "not_a_file",
            Self::InDoubt { .. } => "in_doubt",
            Self::LockTimeout(_) => "lock_timeout",
            Self::SessionBusy => "session_busy",
            Self::InvalidSession => "invalid_session",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest(_) => "invalid_request",
            Self::TooManyTransactions(_) => "too_many_transactions",
            Self::Integrity { .. } => "integrity",
            Self::Config(_) => "config",
        }
    }

    /// Worth retrying inside commit/rollback replay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageIo { .. } | Self::WalDurability(_))
    }
}

fn is_disk_full(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
    )
}

/// AFS result type.
pub type AfsResult<T> = Result<T, AfsError>;
