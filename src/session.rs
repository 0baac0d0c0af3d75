//! Session persistence
//!
//! A session binds a browser to the environment it activated. The store is
//! either process-local or Redis; the remote variant keeps the session as a
//! JSON value under its id with no expiration so any replica of the proxy
//! layer can resolve it.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::User;
use crate::config::RedisConfig;

/// A browser session, possibly bound to an activated environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub id: String,
    #[serde(rename = "envId", default)]
    pub env_id: String,
    #[serde(rename = "envServiceName", default)]
    pub env_service_name: String,
    #[serde(default)]
    pub user: Option<User>,
}

impl Session {
    pub fn new(id: String) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

/// Generate a fresh session id: UUID v4 without dashes.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn set(&self, id: &str, session: &Session) -> Result<()>;
}

/// Process-local session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn set(&self, id: &str, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(id.to_string(), session.clone());
        Ok(())
    }
}

/// Redis-backed session store. Sessions are JSON-encoded under their id with
/// no expiration.
pub struct RedisSessionStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisSessionStore {
    /// Connect and ping. Callers fall back to the in-memory store when this
    /// fails.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = if config.password.is_empty() {
            format!("redis://{}/{}", config.address, config.db)
        } else {
            format!("redis://:{}@{}/{}", config.password, config.address, config.db)
        };
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(id).await?;
        match raw {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(session) => Ok(Some(session)),
                Err(err) => {
                    warn!(id, error = %err, "Discarding undecodable session");
                    Ok(None)
                }
            },
        }
    }

    async fn set(&self, id: &str, session: &Session) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(session)?;
        debug!(id, "Storing session");
        conn.set::<_, _, ()>(id, raw).await?;
        Ok(())
    }
}
