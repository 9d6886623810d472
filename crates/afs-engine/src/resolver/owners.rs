//! Owner lookup against the metadata server.

use async_trait::async_trait;
use std::collections::HashMap;

use afs_types::{OwnerInfo, OwnerKind};

use crate::config::OwnersConfig;
use crate::error::AfsResult;

/// The metadata server's view of owners.
///
/// `None` means the owner does not exist there.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn lookup(&self, owner: &str) -> AfsResult<Option<OwnerInfo>>;
}

/// Owners listed in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticOwnerDirectory {
    owners: HashMap<String, OwnerInfo>,
    accept_unknown: bool,
}

impl StaticOwnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &OwnersConfig) -> Self {
        let mut directory = Self::new().accept_unknown(config.accept_unknown);
        for entry in &config.entries {
            let info = match (&entry.share_id, &entry.location) {
                (Some(share), Some(location)) => {
                    let mut info = OwnerInfo::data_set(&entry.perm_id, share.as_str(), location);
                    info.kind = entry.kind;
                    info
                }
                _ => OwnerInfo::unassigned(&entry.perm_id, entry.kind),
            };
            directory = directory.with_owner(info);
        }
        directory
    }

    /// Unlisted owners resolve as unassigned samples.
    pub fn accept_unknown(mut self, accept: bool) -> Self {
        self.accept_unknown = accept;
        self
    }

    pub fn with_owner(mut self, info: OwnerInfo) -> Self {
        self.owners.insert(info.perm_id.clone(), info);
        self
    }
}

#[async_trait]
impl OwnerDirectory for StaticOwnerDirectory {
    async fn lookup(&self, owner: &str) -> AfsResult<Option<OwnerInfo>> {
        if let Some(info) = self.owners.get(owner) {
            return Ok(Some(info.clone()));
        }
        Ok(self
            .accept_unknown
            .then(|| OwnerInfo::unassigned(owner, OwnerKind::Sample)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OwnerEntry;

    #[tokio::test]
    async fn test_unknown_rejected_by_default() {
        let directory = StaticOwnerDirectory::new();
        assert!(directory.lookup("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accept_unknown() {
        let directory = StaticOwnerDirectory::new().accept_unknown(true);
        let info = directory.lookup("S-1").await.unwrap().unwrap();
        assert_eq!(info.kind, OwnerKind::Sample);
        assert!(info.storage.is_none());
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = OwnersConfig {
            accept_unknown: false,
            entries: vec![
                OwnerEntry {
                    perm_id: "DS-1".into(),
                    kind: OwnerKind::DataSet,
                    share_id: Some("2".into()),
                    location: Some("afs/aa/DS-1".into()),
                },
                OwnerEntry {
                    perm_id: "E-1".into(),
                    kind: OwnerKind::Experiment,
                    share_id: None,
                    location: None,
                },
            ],
        };
        let directory = StaticOwnerDirectory::from_config(&config);
        let ds = directory.lookup("DS-1").await.unwrap().unwrap();
        assert_eq!(ds.storage.unwrap().location, "afs/aa/DS-1");
        let exp = directory.lookup("E-1").await.unwrap().unwrap();
        assert_eq!(exp.kind, OwnerKind::Experiment);
    }
}
