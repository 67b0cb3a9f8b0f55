//! Access tokens that refresh themselves shortly before they expire.

use std::path::PathBuf;
use std::time::Duration;

use agora_live::CredentialProvider;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTokens {
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl StoredTokens {
    pub fn load(path: &std::path::Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let tokens = toml::from_str(&raw).with_context(|| format!("Invalid tokens in {:?}", path))?;
        Ok(Some(tokens))
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let raw = toml::to_string(self)?;
        std::fs::write(path, raw).with_context(|| format!("Failed to write {:?}", path))
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Expiry of a JWT, read from its unverified payload.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp, 0).single()
}

/// Tokens that cannot be decoded count as expiring.
fn expires_within(token: &str, margin: Duration, now: DateTime<Utc>) -> bool {
    match jwt_expiry(token) {
        Some(exp) => exp - now <= chrono::Duration::from_std(margin).unwrap_or_default(),
        None => true,
    }
}

/// Hands out the access token, refreshing it through `POST /token/refresh/`
/// when it is about to expire. A failed refresh keeps the old token so the
/// server gets the final say.
pub struct RefreshingCredentials {
    client: reqwest::Client,
    refresh_url: String,
    margin: Duration,
    tokens: RwLock<StoredTokens>,
    refreshing: tokio::sync::Mutex<()>,
    store: Option<PathBuf>,
}

impl RefreshingCredentials {
    pub fn new(api_base_url: &str, tokens: StoredTokens, margin: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            refresh_url: format!("{}/token/refresh/", api_base_url.trim_end_matches('/')),
            margin,
            tokens: RwLock::new(tokens),
            refreshing: tokio::sync::Mutex::new(()),
            store: None,
        }
    }

    /// Persist refreshed tokens to `path`.
    pub fn with_store(mut self, path: PathBuf) -> Self {
        self.store = Some(path);
        self
    }

    pub fn tokens(&self) -> StoredTokens {
        self.tokens.read().clone()
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let resp = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await
            .context("token refresh request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token refresh returned {}: {}", status, body);
        }
        resp.json().await.context("invalid token refresh response")
    }
}

#[async_trait]
impl CredentialProvider for RefreshingCredentials {
    async fn token(&self) -> Option<String> {
        let current = self.tokens();
        let access = current.access.filter(|t| !t.is_empty())?;
        if !expires_within(&access, self.margin, Utc::now()) {
            return Some(access);
        }
        let Some(refresh_token) = current.refresh.filter(|t| !t.is_empty()) else {
            return Some(access);
        };

        let _guard = self.refreshing.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(latest) = self.tokens().access {
            if latest != access && !expires_within(&latest, self.margin, Utc::now()) {
                return Some(latest);
            }
        }

        debug!("access token expires soon, refreshing");
        match self.refresh(&refresh_token).await {
            Ok(fresh) => {
                let updated = StoredTokens {
                    access: Some(fresh.access.clone()),
                    refresh: Some(fresh.refresh.unwrap_or(refresh_token)),
                };
                if let Some(path) = &self.store {
                    if let Err(e) = updated.save(path) {
                        warn!("could not persist refreshed tokens: {:#}", e);
                    }
                }
                *self.tokens.write() = updated;
                info!("access token refreshed");
                Some(fresh.access)
            }
            Err(e) => {
                warn!("token refresh failed, keeping current token: {:#}", e);
                Some(access)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"user_id":1,"exp":{exp}}}"#));
        format!("{header}.{payload}.signature")
    }

    /// One-shot HTTP server answering with `body`.
    async fn token_server(status: &'static str, body: String) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    fn tokens(access: &str, refresh: &str) -> StoredTokens {
        StoredTokens {
            access: Some(access.to_string()),
            refresh: Some(refresh.to_string()),
        }
    }

    #[test]
    fn test_jwt_expiry_decodes_payload() {
        let exp = Utc::now().timestamp() + 3600;
        assert_eq!(jwt_expiry(&jwt(exp)).map(|d| d.timestamp()), Some(exp));
        assert_eq!(jwt_expiry("not-a-jwt"), None);
        assert_eq!(jwt_expiry("a.!!!.c"), None);
    }

    #[test]
    fn test_expiry_margin() {
        let now = Utc::now();
        let margin = Duration::from_secs(300);
        assert!(!expires_within(&jwt(now.timestamp() + 600), margin, now));
        assert!(expires_within(&jwt(now.timestamp() + 120), margin, now));
        assert!(expires_within("opaque", margin, now));
    }

    #[tokio::test]
    async fn test_fresh_token_is_returned_without_refresh() {
        let access = jwt(Utc::now().timestamp() + 3600);
        // Unroutable refresh endpoint: any refresh attempt would fail loudly.
        let creds = RefreshingCredentials::new(
            "http://127.0.0.1:9/api",
            tokens(&access, "r"),
            Duration::from_secs(300),
        );
        assert_eq!(creds.token().await, Some(access));
    }

    #[tokio::test]
    async fn test_no_access_token_means_signed_out() {
        let creds = RefreshingCredentials::new(
            "http://127.0.0.1:9/api",
            StoredTokens::default(),
            Duration::from_secs(300),
        );
        assert_eq!(creds.token().await, None);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("credentials.toml");
        let old = jwt(Utc::now().timestamp() + 60);
        let new = jwt(Utc::now().timestamp() + 3600);
        let base = token_server("200 OK", format!(r#"{{"access":"{new}"}}"#)).await;

        let creds = RefreshingCredentials::new(&base, tokens(&old, "refresh-1"), Duration::from_secs(300))
            .with_store(path.clone());
        assert_eq!(creds.token().await, Some(new.clone()));

        // The refresh token is kept when the server does not rotate it.
        let expected = tokens(&new, "refresh-1");
        assert_eq!(creds.tokens(), expected);
        assert_eq!(StoredTokens::load(&path).unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_current_token() {
        let old = jwt(Utc::now().timestamp() + 60);
        let base = token_server("401 Unauthorized", r#"{"detail":"expired"}"#.to_string()).await;

        let creds = RefreshingCredentials::new(&base, tokens(&old, "refresh-1"), Duration::from_secs(300));
        assert_eq!(creds.token().await, Some(old.clone()));
        assert_eq!(creds.tokens(), tokens(&old, "refresh-1"));
    }

    #[test]
    fn test_missing_store_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(StoredTokens::load(&tmp.path().join("nope.toml")).unwrap(), None);
    }
}
