//! Transactions: the two-phase-commit participant and its building blocks.
//!
//! - [`TransactionManager`]: begin/execute/prepare/commit/rollback/recover
//! - [`LockTable`]: hierarchical path locks between transactions
//! - [`TransactionRecord`]: per-transaction state rebuilt from the WAL
//! - [`UndoStep`]: replay-safe reversal of one operation

pub mod locks;
pub mod manager;
pub mod operation;
pub mod record;
pub mod undo;

use async_trait::async_trait;

use afs_types::TransactionId;

use crate::error::AfsResult;

pub use locks::{LockMode, LockTable};
pub use manager::TransactionManager;
pub use operation::Operation;
pub use record::{Decision, OpOutcome, TransactionRecord};
pub use undo::UndoStep;

/// The participant interface a 2PC coordinator drives.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn begin(&self, id: TransactionId) -> AfsResult<()>;

    /// `true` when the participant can guarantee commit.
    async fn prepare(&self, id: TransactionId) -> AfsResult<bool>;

    async fn commit(&self, id: TransactionId) -> AfsResult<()>;

    async fn rollback(&self, id: TransactionId) -> AfsResult<()>;

    /// Transactions awaiting a decision.
    async fn recover(&self) -> AfsResult<Vec<TransactionId>>;
}
