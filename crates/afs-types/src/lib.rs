//! Shared identifiers and descriptors for the AFS storage tier.
//!
//! This is a leaf crate: it has **no internal afs dependencies**. The engine
//! and the server both build on it, and so would any client.
//!
//! # Key Types
//!
//! |--------------------|------------------------------------------------|
//! | Type               | Purpose                                        |
//! |--------------------|------------------------------------------------|
//! | [`TransactionId`]  | Coordinator-issued 128-bit transaction id      |
//! | [`OwnerInfo`]      | What the metadata server knows about an owner  |
//! | [`ShareId`]        | One physical storage mount under the root      |
//! | [`File`]           | Listing entry returned to clients              |
//! | [`FreeSpace`]      | Answer of the `free` operation                 |
//! | [`TransactionState`] | ACTIVE → PREPARED → COMMITTED / ROLLED_BACK  |
//! | [`OpKind`]         | Kind of a logged operation                     |
//! |--------------------|------------------------------------------------|

pub mod file;
pub mod ids;
pub mod owner;
pub mod transaction;

pub use file::{File, FreeSpace};
pub use ids::{ShareId, TransactionId};
pub use owner::{AssignedStorage, OwnerInfo, OwnerKind};
pub use transaction::{OpKind, TransactionState};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
