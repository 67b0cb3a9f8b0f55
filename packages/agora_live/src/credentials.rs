//! Token sources for the live channel and the REST client.
//!
//! Sessions ask for a token on every connection attempt and never cache it,
//! so a provider can rotate or refresh tokens underneath a running session.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token, or `None` when signed out.
    async fn token(&self) -> Option<String>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self) -> Option<String> {
        if self.token.is_empty() {
            None
        } else {
            Some(self.token.clone())
        }
    }
}

/// A token slot that can be replaced or cleared at runtime.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(token)),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.inner.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().clone()
    }
}

#[async_trait]
impl CredentialProvider for SharedToken {
    async fn token(&self) -> Option<String> {
        self.get().filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_static_token_is_missing() {
        assert_eq!(StaticCredentials::new("").token().await, None);
        assert_eq!(
            StaticCredentials::new("abc").token().await.as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn shared_token_rotates() {
        let token = SharedToken::new(Some("one".into()));
        let handle = token.clone();
        assert_eq!(token.token().await.as_deref(), Some("one"));
        handle.set("two");
        assert_eq!(token.token().await.as_deref(), Some("two"));
        handle.clear();
        assert_eq!(token.token().await, None);
    }
}
