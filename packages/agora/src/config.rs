use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use agora_live::{LiveConfig, RealtimeEndpoint, ReconnectPolicy};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [api]
//                    base_url = "https://social.example.com/api"
//
//   env var:         AGORA_API__BASE_URL=https://social.example.com/api
//
//   (single underscore stays within field names: AGORA_REALTIME__HEARTBEAT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// REST backend (lives under `[api]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Live channel tunables (lives under `[realtime]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    /// `host[:port]` of the websocket server. Derived from `api.base_url`
    /// when unset.
    #[serde(default)]
    pub host: Option<String>,
    /// Force `wss` (true) or `ws` (false). Follows the API scheme when unset.
    #[serde(default)]
    pub secure: Option<bool>,
    /// Conversation keepalive; 0 disables it.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Cap of the reconnect backoff, shared by both channel kinds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Treat close code 1006 as final on conversation channels.
    #[serde(default = "default_abnormal_close_is_terminal")]
    pub abnormal_close_is_terminal: bool,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            host: None,
            secure: None,
            heartbeat_secs: default_heartbeat_secs(),
            max_attempts: default_max_attempts(),
            max_backoff_secs: default_max_backoff_secs(),
            abnormal_close_is_terminal: default_abnormal_close_is_terminal(),
            send_timeout_secs: default_send_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Identity and tokens (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Seed tokens; `credentials.toml` takes over once a refresh succeeds.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Refresh the access token when it expires within this window.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            username: None,
            access_token: None,
            refresh_token: None,
            refresh_margin_secs: default_refresh_margin_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}
fn default_heartbeat_secs() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    5
}
fn default_max_backoff_secs() -> u64 {
    10
}
fn default_abnormal_close_is_terminal() -> bool {
    true
}
fn default_send_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_refresh_margin_secs() -> u64 {
    300
}

/// Build a figment that layers: defaults → config.toml → AGORA_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `AGORA_API__BASE_URL=...`  →  `api.base_url = ...`
///   `AGORA_REALTIME__MAX_ATTEMPTS=8`  →  `realtime.max_attempts = 8`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("AGORA_").split("__"))
}

impl FileConfig {
    /// Runtime view handed to the live channels.
    pub fn live_config(&self) -> LiveConfig {
        let mut live = LiveConfig::for_api_base(&self.api.base_url);
        let rt = &self.realtime;

        live.endpoint = match &rt.host {
            Some(host) => RealtimeEndpoint::new(
                host.clone(),
                rt.secure
                    .unwrap_or_else(|| self.api.base_url.starts_with("https://")),
            ),
            None => RealtimeEndpoint::from_api_base(&self.api.base_url, rt.secure),
        };
        live.conversation_policy = ReconnectPolicy {
            max_attempts: rt.max_attempts,
            max_delay: Duration::from_secs(rt.max_backoff_secs),
            abnormal_close_is_terminal: rt.abnormal_close_is_terminal,
            ..ReconnectPolicy::conversation()
        };
        live.notification_policy = ReconnectPolicy {
            max_attempts: rt.max_attempts,
            max_delay: Duration::from_secs(rt.max_backoff_secs),
            ..ReconnectPolicy::notifications()
        };
        live.conversation_heartbeat =
            (rt.heartbeat_secs > 0).then(|| Duration::from_secs(rt.heartbeat_secs));
        live.send_timeout = Duration::from_secs(rt.send_timeout_secs);
        live.poll_interval = Duration::from_secs(rt.poll_interval_secs.max(1));
        live
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --config-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct AgoraConfig {
    pub config_dir: PathBuf,
}

impl AgoraConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".agora"),
        };

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        debug!("Config directory: {}", config_dir.display());

        Ok(Self { config_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Tokens written back after a refresh.
    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir.join("credentials.toml")
    }

    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.config_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))
    }
}
