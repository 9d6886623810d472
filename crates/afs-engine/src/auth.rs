//! Session authentication.
//!
//! The authentication service is an external collaborator; the engine only
//! needs to know whether a token is still good. [`InMemoryAuthenticator`]
//! covers single-node deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::error::AfsResult;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Session token for valid credentials, `None` otherwise.
    async fn login(&self, user: &str, password: &str) -> AfsResult<Option<String>>;

    async fn is_session_valid(&self, token: &str) -> AfsResult<bool>;

    async fn logout(&self, token: &str) -> AfsResult<()>;
}

/// Users from configuration, sessions in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuthenticator {
    users: HashMap<String, String>,
    /// token → user
    sessions: DashMap<String, String>,
}

impl InMemoryAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let mut auth = Self::new();
        for user in &config.users {
            auth = auth.with_user(&user.name, &user.password);
        }
        auth
    }

    pub fn with_user(mut self, name: &str, password: &str) -> Self {
        self.users.insert(name.to_string(), password.to_string());
        self
    }

    /// User owning a session.
    pub fn user_of(&self, token: &str) -> Option<String> {
        self.sessions.get(token).map(|u| u.value().clone())
    }
}

#[async_trait]
impl Authenticator for InMemoryAuthenticator {
    async fn login(&self, user: &str, password: &str) -> AfsResult<Option<String>> {
        match self.users.get(user) {
            Some(expected) if expected == password => {
                let token = uuid::Uuid::new_v4().simple().to_string();
                self.sessions.insert(token.clone(), user.to_string());
                info!(user, "login");
                Ok(Some(token))
            }
            _ => {
                debug!(user, "login refused");
                Ok(None)
            }
        }
    }

    async fn is_session_valid(&self, token: &str) -> AfsResult<bool> {
        Ok(self.sessions.contains_key(token))
    }

    async fn logout(&self, token: &str) -> AfsResult<()> {
        if let Some((_, user)) = self.sessions.remove(token) {
            info!(user, "logout");
        }
        Ok(())
    }
}
