//! Auth provider interface and user store
//!
//! Authentication itself is an external collaborator: the core only consumes
//! the `AuthProvider` trait. When no provider is configured every endpoint
//! runs unauthenticated with no user.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// An authenticated user as reported by the auth provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "accessToken", default)]
    pub access_token: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
}

/// External identity provider.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Complete a browser auth flow from the callback query parameters.
    async fn on_auth_callback(&self, params: &HashMap<String, String>) -> Result<User>;

    /// Resolve an access token presented directly by an API client.
    async fn login_user(&self, access_token: &str) -> Result<User>;

    /// Whether the user may view the given repository.
    async fn user_can_view_repo(&self, user: &User, repo: &str) -> Result<bool>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, access_token: &str) -> Result<Option<User>>;
    async fn set(&self, access_token: &str, user: &User) -> Result<()>;
}

/// Process-local user cache keyed by access token.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get(&self, access_token: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(access_token).cloned())
    }

    async fn set(&self, access_token: &str, user: &User) -> Result<()> {
        self.users
            .write()
            .await
            .insert(access_token.to_string(), user.clone());
        Ok(())
    }
}
