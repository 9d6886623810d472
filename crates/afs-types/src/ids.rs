//! Typed identifiers for transactions and shares.
//!
//! `TransactionId` wraps a 128-bit UUID chosen by the coordinator. It is
//! opaque on the wire (standard hyphenated UUID text) and doubles as the WAL
//! file stem, so its `Display` form must stay stable. The `short()` form is
//! for log lines only, never a lookup key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A coordinator-issued transaction identifier.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(uuid::Uuid);

impl TransactionId {
    /// Create a random id (UUIDv4). Used for autocommit transactions, which
    /// the participant opens on its own behalf.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// First 8 hex characters, for human display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Reconstruct from 16 bytes.
    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(b))
    }

    /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }

    /// A nil ID, for sentinel values only.
    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }

    /// Check if this is the nil ID.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<uuid::Uuid> for TransactionId {
    fn from(u: uuid::Uuid) -> Self {
        Self(u)
    }
}

impl From<TransactionId> for uuid::Uuid {
    fn from(id: TransactionId) -> uuid::Uuid {
        id.0
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.short())
    }
}

/// Identifier of a share: the directory name of a mount under the storage
/// root (`"1"`, `"2"`, ...).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(String);

impl ShareId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value of the id, if the share directory is named by a number.
    pub fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareId({})", self.0)
    }
}

impl From<&str> for ShareId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
