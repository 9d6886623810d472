//! # afs-engine
//!
//! Transactional storage engine for the AFS tier.
//!
//! Files live on plain directory trees ("shares") under a storage root.
//! The engine:
//! - Resolves `(owner, relative path)` to a physical path on some share
//! - Executes file operations under coordinator-issued transaction ids
//! - Logs every mutation ahead of time so a crash never loses the outcome
//! - Answers `prepare`, `commit`, `rollback` and `recover` as a 2PC participant
//!
//! The server crate wraps this in sessions and a wire protocol.

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod resolver;
pub mod storage;
pub mod transaction;
pub mod wal;
pub mod worker;

pub use auth::{Authenticator, InMemoryAuthenticator};
pub use config::{AfsConfig, AllocationPolicy, RetryConfig, StorageConfig, TransactionConfig};
pub use error::{AfsError, AfsResult, ErrorClass};
pub use proxy::Proxy;
pub use resolver::{
    OwnerDirectory, PathResolver, PhysicalLocation, ResolvedPath, Share, StaticOwnerDirectory,
    discover_shares,
};
pub use storage::{Entry, EntryKind, Listing, LocalStorage, StorageOps};
pub use transaction::{Coordinator, Operation, TransactionManager};
pub use wal::{WalRecord, WriteAheadLog};
pub use worker::Worker;
