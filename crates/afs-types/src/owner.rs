//! Owner references.
//!
//! An owner is the experiment, sample, or data set a stored file belongs to.
//! Identity lives in the metadata server; the storage tier only sees the
//! perm id and, for data sets that were already placed, the assigned share
//! and location.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::ShareId;

/// Entity kind of an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OwnerKind {
    Experiment,
    Sample,
    DataSet,
}

/// Physical storage already assigned to a data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedStorage {
    /// Share holding the data set.
    pub share_id: ShareId,
    /// Location relative to the share root.
    pub location: String,
}

/// What the metadata server reports about an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    /// Permanent identifier (also the owner directory name).
    pub perm_id: String,
    pub kind: OwnerKind,
    /// Set only for data sets with assigned physical storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<AssignedStorage>,
}

impl OwnerInfo {
    /// An owner without assigned storage (sample, experiment, or fresh data set).
    pub fn unassigned(perm_id: impl Into<String>, kind: OwnerKind) -> Self {
        Self {
            perm_id: perm_id.into(),
            kind,
            storage: None,
        }
    }

    /// A data set with assigned storage.
    pub fn data_set(
        perm_id: impl Into<String>,
        share_id: impl Into<ShareId>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            perm_id: perm_id.into(),
            kind: OwnerKind::DataSet,
            storage: Some(AssignedStorage {
                share_id: share_id.into(),
                location: location.into(),
            }),
        }
    }
}
