//! Storage engine: primitive file operations on physical paths.
//!
//! [`StorageOps`] is the seam between the transaction manager and the
//! disk. [`LocalStorage`] is the only production implementation; tests wrap
//! it to inject faults.

pub mod digest;
pub mod listing;
pub mod local;
pub mod ops;
pub mod types;

pub use listing::Listing;
pub use local::LocalStorage;
pub use ops::StorageOps;
pub use types::{Entry, EntryKind};
