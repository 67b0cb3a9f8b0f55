pub mod chat;
pub mod conversations;
pub mod notifications;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::debug;

use agora_live::{
    ChannelDeps, CredentialProvider, CurrentUser, HttpApi, MessagingApi, UserId, WsConnector,
};

use crate::config::{AgoraConfig, FileConfig};
use crate::credentials::{RefreshingCredentials, StoredTokens};

/// Everything a sub-command needs to talk to the backend.
pub struct Client {
    pub me: CurrentUser,
    pub api: Arc<HttpApi>,
    pub deps: ChannelDeps,
}

impl Client {
    pub fn new(config: &AgoraConfig, fc: &FileConfig) -> Result<Self> {
        let user_id = fc.auth.user_id.clone().with_context(|| {
            format!(
                "No user configured: set [auth] user_id in {} or AGORA_AUTH__USER_ID",
                config.config_toml_path().display()
            )
        })?;
        let me = CurrentUser::new(
            UserId::from(user_id),
            fc.auth.username.clone().unwrap_or_default(),
        );

        // Tokens written by an earlier refresh win over the seed tokens.
        let tokens = match StoredTokens::load(&config.credentials_path())? {
            Some(stored) => stored,
            None => StoredTokens {
                access: fc.auth.access_token.clone(),
                refresh: fc.auth.refresh_token.clone(),
            },
        };
        if tokens.access.is_none() {
            anyhow::bail!(
                "No access token: set [auth] access_token in {} or AGORA_AUTH__ACCESS_TOKEN",
                config.config_toml_path().display()
            );
        }

        let live = fc.live_config();
        let credentials: Arc<dyn CredentialProvider> = Arc::new(
            RefreshingCredentials::new(
                &live.api_base_url,
                tokens,
                Duration::from_secs(fc.auth.refresh_margin_secs),
            )
            .with_store(config.credentials_path()),
        );
        let api = Arc::new(HttpApi::new(&live.api_base_url, credentials.clone()));
        debug!(api = %live.api_base_url, realtime = %live.endpoint.host(), "client configured");

        let deps = ChannelDeps::new(
            live,
            Arc::new(WsConnector),
            credentials,
            api.clone() as Arc<dyn MessagingApi>,
        );
        Ok(Self { me, api, deps })
    }
}

/// Line reader over stdin.
pub(crate) fn stdin_lines() -> Lines<BufReader<Stdin>> {
    BufReader::new(tokio::io::stdin()).lines()
}

/// `HH:MM` in local time.
pub(crate) fn clock(at: chrono::DateTime<chrono::Utc>) -> String {
    at.with_timezone(&chrono::Local).format("%H:%M").to_string()
}

/// Split `"/cmd rest of line"` into `("cmd", "rest of line")`.
pub(crate) fn split_command(line: &str) -> Option<(&str, &str)> {
    let body = line.strip_prefix('/')?;
    match body.split_once(char::is_whitespace) {
        Some((cmd, rest)) => Some((cmd, rest.trim())),
        None => Some((body, "")),
    }
}
