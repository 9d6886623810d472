//! Transaction lifecycle vocabulary shared by the engine and its clients.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Participant-side state of a transaction.
///
/// `Active → Prepared → {Committed | RolledBack}`; `Active → RolledBack` is
/// also allowed. Terminal states are never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Returns true for `Committed` and `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

/// Kind of a storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    List,
    Read,
    Write,
    Delete,
    Copy,
    Move,
    Create,
}

impl OpKind {
    /// Returns true for operations that change the filesystem.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, OpKind::List | OpKind::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TransactionState::Active.is_terminal());
        assert!(!TransactionState::Prepared.is_terminal());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(TransactionState::RolledBack.to_string(), "ROLLED_BACK");
        let json = serde_json::to_string(&TransactionState::Prepared).unwrap();
        assert_eq!(json, "\"PREPARED\"");
    }

    #[test]
    fn test_mutations() {
        assert!(OpKind::Write.is_mutation());
        assert!(OpKind::Move.is_mutation());
        assert!(!OpKind::Read.is_mutation());
        assert!(!OpKind::List.is_mutation());
    }
}
