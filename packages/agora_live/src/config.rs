use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CredentialProvider;
use crate::endpoint::RealtimeEndpoint;
use crate::policy::ReconnectPolicy;
use crate::rest::MessagingApi;
use crate::session::SessionConfig;
use crate::store::SEND_TIMEOUT;
use crate::transport::Connector;
use crate::typing::TYPING_EXPIRY;

/// Runtime settings shared by every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    /// REST base, e.g. `https://host/api`.
    pub api_base_url: String,
    pub endpoint: RealtimeEndpoint,
    pub conversation_policy: ReconnectPolicy,
    pub notification_policy: ReconnectPolicy,
    pub conversation_heartbeat: Option<Duration>,
    pub notification_heartbeat: Option<Duration>,
    /// How long an optimistic message may wait for its echo.
    pub send_timeout: Duration,
    pub typing_expiry: Duration,
    /// Idle time after the last keystroke before "stopped typing" is sent.
    pub typing_idle: Duration,
    /// Full reload period while the live channel is down.
    pub poll_interval: Duration,
    /// Delay between a REST send and the reload that follows it.
    pub fallback_reload_delay: Duration,
}

impl LiveConfig {
    pub fn for_api_base(api_base_url: &str) -> Self {
        Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            endpoint: RealtimeEndpoint::from_api_base(api_base_url, None),
            conversation_policy: ReconnectPolicy::conversation(),
            notification_policy: ReconnectPolicy::notifications(),
            conversation_heartbeat: Some(Duration::from_secs(20)),
            notification_heartbeat: None,
            send_timeout: SEND_TIMEOUT,
            typing_expiry: TYPING_EXPIRY,
            typing_idle: Duration::from_secs(2),
            poll_interval: Duration::from_secs(5),
            fallback_reload_delay: Duration::from_millis(500),
        }
    }

    pub fn conversation_session(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            policy: self.conversation_policy.clone(),
            heartbeat: self.conversation_heartbeat,
        }
    }

    pub fn notification_session(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            policy: self.notification_policy.clone(),
            heartbeat: self.notification_heartbeat,
        }
    }
}

/// Everything a channel needs to open.
#[derive(Clone)]
pub struct ChannelDeps {
    pub config: LiveConfig,
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub api: Arc<dyn MessagingApi>,
}

impl ChannelDeps {
    pub fn new(
        config: LiveConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        api: Arc<dyn MessagingApi>,
    ) -> Self {
        Self {
            config,
            connector,
            credentials,
            api,
        }
    }
}
