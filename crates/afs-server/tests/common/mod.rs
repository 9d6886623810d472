//! Shared fixtures for the server integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use afs_engine::config::{OwnerEntry, UserEntry};
use afs_engine::storage::digest::md5_hex;
use afs_engine::{AfsConfig, StorageConfig, TransactionConfig};
use afs_server::{ApiServer, Request, Response};
use afs_types::OwnerKind;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tempfile::TempDir;

pub const INTERACTIVE_KEY: &str = "test-interactive-key";
pub const MANAGER_KEY: &str = "test-manager-key";

/// A storage root with two shares, a WAL directory and a config pointing at both.
pub struct Deployment {
    pub dir: TempDir,
    pub config: AfsConfig,
}

impl Deployment {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store");
        for share in ["1", "2"] {
            std::fs::create_dir_all(store.join(share)).unwrap();
        }

        let mut config = AfsConfig::default();
        config.server.interactive_session_key = INTERACTIVE_KEY.into();
        config.server.transaction_manager_key = MANAGER_KEY.into();
        config.storage = StorageConfig::default().with_root(&store);
        config.transactions = TransactionConfig::new(dir.path().join("wal"))
            .with_lock_timeout(Duration::from_millis(200));
        config.auth.users.push(UserEntry {
            name: "lab".into(),
            password: "pipette".into(),
        });
        config.owners.accept_unknown = true;
        config.owners.entries.push(OwnerEntry {
            perm_id: "DS-7".into(),
            kind: OwnerKind::DataSet,
            share_id: Some("2".into()),
            location: Some("afs/assigned/DS-7".into()),
        });
        config.validate().unwrap();
        Self { dir, config }
    }

    pub async fn start(&self) -> Arc<ApiServer> {
        Arc::new(ApiServer::open(&self.config).await.unwrap())
    }

    pub fn store(&self) -> PathBuf {
        self.config.storage.root.clone()
    }
}

/// One logged-in client.
pub struct Client {
    pub api: Arc<ApiServer>,
    pub token: String,
    pub interactive: bool,
    pub manager_key: bool,
    next_id: u64,
}

impl Client {
    pub async fn login(api: &Arc<ApiServer>) -> Self {
        let response = api
            .handle(Request {
                id: json!(0),
                method: "login".into(),
                params: json!({ "user": "lab", "password": "pipette" }),
                ..Request::default()
            })
            .await;
        let token = response.result.unwrap()["sessionToken"]
            .as_str()
            .unwrap()
            .to_string();
        Self {
            api: Arc::clone(api),
            token,
            interactive: false,
            manager_key: false,
            next_id: 1,
        }
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn coordinator(mut self) -> Self {
        self.manager_key = true;
        self
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Response {
        self.next_id += 1;
        let response = self
            .api
            .handle(Request {
                id: json!(self.next_id),
                method: method.into(),
                params,
                session_token: Some(self.token.clone()),
                interactive_session_key: self.interactive.then(|| INTERACTIVE_KEY.to_string()),
                transaction_manager_key: self.manager_key.then(|| MANAGER_KEY.to_string()),
            })
            .await;
        assert_eq!(response.id, json!(self.next_id));
        response
    }

    /// Call and expect success.
    pub async fn ok(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params).await;
        if let Some(error) = response.error {
            panic!("{method} failed: {error:?}");
        }
        response.result.unwrap_or(Value::Null)
    }

    /// Call and expect an error of `kind`.
    pub async fn fails(&mut self, method: &str, params: Value, kind: &str) -> u16 {
        let response = self.call(method, params).await;
        let error = response
            .error
            .unwrap_or_else(|| panic!("{method} unexpectedly succeeded"));
        assert_eq!(error.kind, kind, "{method}: {}", error.message);
        error.status
    }

    pub async fn write(&mut self, owner: &str, source: &str, data: &[u8]) {
        self.ok("write", write_params(owner, source, data)).await;
    }

    pub async fn read(&mut self, owner: &str, source: &str) -> Vec<u8> {
        let result = self
            .ok("read", json!({ "owner": owner, "source": source }))
            .await;
        BASE64.decode(result["data"].as_str().unwrap()).unwrap()
    }
}

pub fn write_params(owner: &str, source: &str, data: &[u8]) -> Value {
    json!({
        "owner": owner,
        "source": source,
        "offset": 0,
        "data": BASE64.encode(data),
        "md5": md5_hex(data),
    })
}
