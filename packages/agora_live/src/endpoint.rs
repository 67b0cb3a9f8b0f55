use std::fmt;

use crate::models::{ConversationId, UserId};

/// What a session connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelTarget {
    Notifications(UserId),
    Conversation(ConversationId),
}

impl ChannelTarget {
    pub fn path(&self) -> String {
        match self {
            Self::Notifications(user) => format!("/ws/notifications/{user}/"),
            Self::Conversation(conv) => format!("/ws/conversations/{conv}/"),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::Notifications(user) => !user.is_empty(),
            Self::Conversation(conv) => !conv.is_empty(),
        }
    }
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notifications(user) => write!(f, "notifications:{user}"),
            Self::Conversation(conv) => write!(f, "conversation:{conv}"),
        }
    }
}

const DEFAULT_HOST: &str = "localhost:8000";

/// Host and scheme of the realtime server, derived from the API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeEndpoint {
    host: String,
    secure: bool,
}

impl RealtimeEndpoint {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            secure,
        }
    }

    /// Strips the scheme and any trailing `/api` from `api_base`. `secure`
    /// overrides the scheme; when `None` an `https` base selects `wss`.
    pub fn from_api_base(api_base: &str, secure: Option<bool>) -> Self {
        let trimmed = api_base.trim();
        let (https, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (false, rest)
        } else {
            (false, trimmed)
        };

        let mut host = rest.trim_end_matches('/');
        if let Some(stripped) = host.strip_suffix("/api") {
            host = stripped.trim_end_matches('/');
        }

        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Self::new(host, secure.unwrap_or(https))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    pub fn url_for(&self, target: &ChannelTarget, token: &str) -> String {
        format!(
            "{}://{}{}?token={}",
            self.scheme(),
            self.host,
            target.path(),
            urlencoding::encode(token)
        )
    }
}

impl Default for RealtimeEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_and_api_suffix() {
        let ep = RealtimeEndpoint::from_api_base("https://social.example.com/api/", None);
        assert_eq!(ep.host(), "social.example.com");
        assert_eq!(ep.scheme(), "wss");

        let ep = RealtimeEndpoint::from_api_base("http://127.0.0.1:8000/api", None);
        assert_eq!(ep.host(), "127.0.0.1:8000");
        assert_eq!(ep.scheme(), "ws");
    }

    #[test]
    fn secure_override_wins() {
        let ep = RealtimeEndpoint::from_api_base("http://host/api", Some(true));
        assert_eq!(ep.scheme(), "wss");
    }

    #[test]
    fn empty_base_falls_back_to_local_dev_host() {
        let ep = RealtimeEndpoint::from_api_base("", None);
        assert_eq!(ep.host(), "localhost:8000");
    }

    #[test]
    fn url_encodes_token() {
        let ep = RealtimeEndpoint::new("host", false);
        let url = ep.url_for(&ChannelTarget::Conversation(ConversationId::from(9)), "a b+c");
        assert_eq!(url, "ws://host/ws/conversations/9/?token=a%20b%2Bc");

        let url = ep.url_for(&ChannelTarget::Notifications(UserId::from(3)), "t");
        assert_eq!(url, "ws://host/ws/notifications/3/?token=t");
    }

    #[test]
    fn empty_ids_are_invalid_targets() {
        assert!(!ChannelTarget::Conversation(ConversationId::from("")).is_valid());
        assert!(ChannelTarget::Notifications(UserId::from(1)).is_valid());
    }
}
