//! Request dispatcher.
//!
//! One JSON object per request:
//!
//! ```text
//! { "id": 7, "method": "write", "params": { ... },
//!   "sessionToken": "...", "interactiveSessionKey": "...", "transactionManagerKey": "..." }
//! ```
//!
//! answered by `{ "id": 7, "result": ... }` or
//! `{ "id": 7, "error": { "kind", "class", "status", "message" } }`.
//!
//! Requests carrying the interactive session key run against the session's
//! worker, so a transaction begun in one request spans the following ones.
//! Any other request runs exactly one data operation as its own autocommit
//! transaction and cannot use transaction control. `recover`, and finishing
//! a transaction the session is not bound to, need the transaction manager key.

use std::sync::Arc;
use std::time::Instant;

use afs_engine::config::ServerConfig;
use afs_engine::{
    AfsConfig, AfsError, AfsResult, Authenticator, InMemoryAuthenticator, LocalStorage,
    PathResolver, Proxy, StaticOwnerDirectory, StorageOps, TransactionManager, Worker,
};
use afs_types::TransactionId;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::constants::MAX_READ_BYTES;
use crate::session_table::{SessionTable, WorkerHandle};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive_session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_manager_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    /// `rejected`, `retryable` or `outcome_unknown`.
    pub class: String,
    pub status: u16,
    pub message: String,
}

impl From<&AfsError> for ErrorBody {
    fn from(err: &AfsError) -> Self {
        Self {
            kind: err.kind().to_string(),
            class: err.class().to_string(),
            status: err.status(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, err: &AfsError) -> Self {
        Self {
            id,
            result: None,
            error: Some(err.into()),
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Deserialize)]
struct LoginParams {
    user: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathParams {
    owner: String,
    #[serde(default)]
    source: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    owner: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    recursive: bool,
    after: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadParams {
    owner: String,
    source: String,
    #[serde(default)]
    offset: i64,
    limit: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteParams {
    owner: String,
    source: String,
    #[serde(default)]
    offset: i64,
    /// base64
    data: String,
    md5: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferParams {
    owner: String,
    source: String,
    target_owner: String,
    target: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    owner: String,
    source: String,
    #[serde(default)]
    directory: bool,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionParams {
    transaction_id: Option<TransactionId>,
}

fn params<T: DeserializeOwned>(value: &Value) -> AfsResult<T> {
    let value = if value.is_null() { json!({}) } else { value.clone() };
    serde_json::from_value(value).map_err(|e| AfsError::InvalidRequest(e.to_string()))
}

fn to_value<T: Serialize>(value: T) -> AfsResult<Value> {
    serde_json::to_value(value).map_err(|e| AfsError::InvalidRequest(e.to_string()))
}

const TRANSACTION_METHODS: &[&str] = &["begin", "prepare", "commit", "rollback", "recover"];

// ============================================================================
// Dispatcher
// ============================================================================

pub struct ApiServer {
    config: ServerConfig,
    auth: Arc<dyn Authenticator>,
    resolver: Arc<PathResolver>,
    manager: Arc<TransactionManager>,
    sessions: SessionTable,
}

impl ApiServer {
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        resolver: Arc<PathResolver>,
        manager: Arc<TransactionManager>,
    ) -> Self {
        Self {
            config,
            auth,
            resolver,
            manager,
            sessions: SessionTable::new(),
        }
    }

    /// Build everything from configuration and replay the WAL.
    pub async fn open(config: &AfsConfig) -> AfsResult<Self> {
        let storage: Arc<dyn StorageOps> = Arc::new(LocalStorage::new());
        let manager = TransactionManager::open(storage, config.transactions.clone()).await?;
        let in_doubt = manager.recover().await;
        if !in_doubt.is_empty() {
            warn!(count = in_doubt.len(), "in-doubt transactions await the coordinator");
        }

        let owners = Arc::new(StaticOwnerDirectory::from_config(&config.owners));
        let resolver = PathResolver::from_config(&config.storage, owners).await?;
        let auth = Arc::new(InMemoryAuthenticator::from_config(&config.auth));
        Ok(Self::new(
            config.server.clone(),
            auth,
            Arc::new(resolver),
            Arc::new(manager),
        ))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Drop idle sessions and report transactions the coordinator forgot.
    pub fn sweep(&self, now: Instant) {
        self.sessions.sweep(now, self.config.worker_idle_timeout());
        for id in self.manager.expired(now) {
            warn!(transaction = %id, "transaction idle past its timeout");
        }
    }

    /// Handle one raw request line.
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::err(Value::Null, &AfsError::InvalidRequest(e.to_string())),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"id":null,"error":{{"kind":"invalid_request","class":"rejected","status":500,"message":"{e}"}}}}"#)
        })
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone();
        match self.dispatch(&request).await {
            Ok(result) => Response::ok(id, result),
            Err(err) => {
                if err.status() >= 500 {
                    warn!(method = %request.method, error = %err, "request failed");
                } else {
                    debug!(method = %request.method, error = %err, "request rejected");
                }
                Response::err(id, &err)
            }
        }
    }

    async fn dispatch(&self, request: &Request) -> AfsResult<Value> {
        match request.method.as_str() {
            "login" => self.login(&request.params).await,
            "isSessionValid" => {
                let token = request.session_token.as_deref().unwrap_or_default();
                let valid = self.sessions.get(token).is_ok() && self.auth.is_session_valid(token).await?;
                Ok(Value::Bool(valid))
            }
            "logout" => {
                let token = request.session_token.as_deref().ok_or(AfsError::InvalidSession)?;
                if let Some(handle) = self.sessions.remove(token) {
                    if let Ok(proxy) = handle.checkout() {
                        if let Some(id) = proxy.worker().transaction() {
                            info!(transaction = %id, "session closed with a bound transaction");
                        }
                    }
                }
                self.auth.logout(token).await?;
                Ok(Value::Null)
            }
            _ => self.session_call(request).await,
        }
    }

    async fn login(&self, raw: &Value) -> AfsResult<Value> {
        let p: LoginParams = params(raw)?;
        let token = self
            .auth
            .login(&p.user, &p.password)
            .await?
            .ok_or(AfsError::InvalidSession)?;
        self.sessions
            .insert(token.clone(), WorkerHandle::new(self.proxy(&token)));
        Ok(json!({ "sessionToken": token }))
    }

    fn proxy(&self, token: &str) -> Proxy {
        Proxy::new(
            token,
            Arc::clone(&self.auth),
            Arc::clone(&self.resolver),
            Worker::new(token, Arc::clone(&self.manager)),
        )
    }

    async fn session_call(&self, request: &Request) -> AfsResult<Value> {
        let token = request.session_token.as_deref().ok_or(AfsError::InvalidSession)?;
        let handle = self.sessions.get(token)?;
        let mut session = handle.checkout()?;

        let interactive =
            request.interactive_session_key.as_deref() == Some(self.config.interactive_session_key.as_str());
        let manager_key =
            request.transaction_manager_key.as_deref() == Some(self.config.transaction_manager_key.as_str());
        let method = request.method.as_str();

        if TRANSACTION_METHODS.contains(&method) {
            return self
                .transaction_call(&mut session, method, &request.params, interactive, manager_key)
                .await;
        }
        if interactive {
            self.data_call(&mut session, method, &request.params).await
        } else {
            let mut one_shot = self.proxy(token);
            self.data_call(&mut one_shot, method, &request.params).await
        }
    }

    async fn transaction_call(
        &self,
        proxy: &mut Proxy,
        method: &str,
        raw: &Value,
        interactive: bool,
        manager_key: bool,
    ) -> AfsResult<Value> {
        let require_manager_key = || {
            if manager_key {
                Ok(())
            } else {
                Err(AfsError::Forbidden(format!(
                    "{method} needs the transaction manager key"
                )))
            }
        };
        let require_interactive = || {
            if interactive {
                Ok(())
            } else {
                Err(AfsError::state(format!(
                    "{method} needs an interactive session"
                )))
            }
        };

        if method == "recover" {
            require_manager_key()?;
            let ids = proxy.recover().await?;
            return to_value(ids.iter().map(ToString::to_string).collect::<Vec<_>>());
        }

        let p: TransactionParams = params(raw)?;
        let bound = proxy.worker().transaction();
        if method == "begin" {
            require_interactive()?;
            let id = p
                .transaction_id
                .ok_or_else(|| AfsError::InvalidRequest("begin needs a transactionId".into()))?;
            proxy.begin(id).await?;
            return Ok(Value::Null);
        }

        match p.transaction_id.filter(|id| Some(*id) != bound) {
            None => {
                require_interactive()?;
                match method {
                    "prepare" => Ok(Value::Bool(proxy.prepare().await?)),
                    "commit" => proxy.commit().await.map(|()| Value::Null),
                    _ => proxy.rollback().await.map(|()| Value::Null),
                }
            }
            Some(id) => {
                require_manager_key()?;
                match method {
                    "prepare" => Ok(Value::Bool(proxy.prepare_transaction(id).await?)),
                    "commit" => proxy.commit_transaction(id).await.map(|()| Value::Null),
                    _ => proxy.rollback_transaction(id).await.map(|()| Value::Null),
                }
            }
        }
    }

    async fn data_call(&self, proxy: &mut Proxy, method: &str, raw: &Value) -> AfsResult<Value> {
        match method {
            "list" => {
                let p: ListParams = params(raw)?;
                let files = proxy
                    .list_page(&p.owner, &p.source, p.recursive, p.after.as_deref(), p.limit)
                    .await?;
                to_value(files)
            }
            "read" => {
                let p: ReadParams = params(raw)?;
                let limit = p.limit.unwrap_or(MAX_READ_BYTES).min(MAX_READ_BYTES);
                let data = proxy.read(&p.owner, &p.source, p.offset, limit).await?;
                Ok(json!({ "data": BASE64.encode(data) }))
            }
            "write" => {
                let p: WriteParams = params(raw)?;
                let data = BASE64
                    .decode(p.data.as_bytes())
                    .map_err(|e| AfsError::InvalidRequest(format!("data: {e}")))?;
                proxy.write(&p.owner, &p.source, p.offset, data, &p.md5).await?;
                Ok(Value::Null)
            }
            "delete" => {
                let p: PathParams = params(raw)?;
                Ok(Value::Bool(proxy.delete(&p.owner, &p.source).await?))
            }
            "copy" => {
                let p: TransferParams = params(raw)?;
                proxy.copy(&p.owner, &p.source, &p.target_owner, &p.target).await?;
                Ok(Value::Null)
            }
            "move" => {
                let p: TransferParams = params(raw)?;
                proxy
                    .move_path(&p.owner, &p.source, &p.target_owner, &p.target)
                    .await?;
                Ok(Value::Null)
            }
            "create" => {
                let p: CreateParams = params(raw)?;
                Ok(Value::Bool(proxy.create(&p.owner, &p.source, p.directory).await?))
            }
            "free" => {
                let p: PathParams = params(raw)?;
                to_value(proxy.free(&p.owner, &p.source).await?)
            }
            other => Err(AfsError::InvalidRequest(format!("unknown method {other:?}"))),
        }
    }
}
