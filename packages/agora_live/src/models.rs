//! Business entities mirrored from the backend.
//!
//! The backend owns these records; the client only deserializes what the
//! live channel and the REST endpoints hand it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Defines a string-backed identifier that also accepts JSON numbers, since
/// the backend is not consistent about which one it sends.
macro_rules! flexible_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Empty ids never name a real channel.
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Raw {
                    Number(i64),
                    Text(String),
                }

                Ok(match Raw::deserialize(deserializer)? {
                    Raw::Number(n) => Self(n.to_string()),
                    Raw::Text(s) => Self(s),
                })
            }
        }
    };
}

flexible_id!(
    /// Backend user id.
    UserId
);

flexible_id!(
    /// Backend conversation id.
    ConversationId
);

/// Author of a message as embedded by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default, alias = "_id")]
    pub id: Option<UserId>,
    #[serde(default)]
    pub username: String,
}

/// The signed-in user, used to recognise our own messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub username: String,
}

impl CurrentUser {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }

    /// A sender is us when either the id or the (non-empty) username matches.
    pub fn is(&self, sender: &Sender) -> bool {
        if sender.id.as_ref() == Some(&self.id) {
            return true;
        }
        !self.username.is_empty() && sender.username == self.username
    }

    pub fn as_sender(&self) -> Sender {
        Sender {
            id: Some(self.id.clone()),
            username: self.username.clone(),
        }
    }
}

/// A chat message as confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "image")]
    pub image_url: Option<String>,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_edited: bool,
}

/// A user notification (friend request, reply, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "type")]
    pub notification_type: String,
    #[serde(default, alias = "read")]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub friend_request_id: Option<i64>,
    /// Set locally when the server reports the linked friend request as no
    /// longer actionable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

/// One participant of a conversation listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default, alias = "_id")]
    pub id: Option<UserId>,
    #[serde(default)]
    pub username: String,
}

/// A conversation as returned by the conversations endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Participants other than `me`, joined for display.
    pub fn title_for(&self, me: &UserId) -> String {
        let names: Vec<&str> = self
            .participants
            .iter()
            .filter(|p| p.id.as_ref() != Some(me))
            .map(|p| p.username.as_str())
            .collect();
        if names.is_empty() {
            format!("conversation {}", self.id)
        } else {
            names.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_accept_numbers_and_strings() {
        let a: UserId = serde_json::from_str("42").unwrap();
        let b: UserId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "42");
    }

    #[test]
    fn empty_id_is_detected() {
        assert!(ConversationId::from("  ").is_empty());
        assert!(!ConversationId::from(7).is_empty());
    }

    #[test]
    fn sender_accepts_legacy_underscore_id() {
        let sender: Sender = serde_json::from_str(r#"{"_id": 3, "username": "bob"}"#).unwrap();
        assert_eq!(sender.id, Some(UserId::from(3)));
    }

    #[test]
    fn current_user_matches_by_id_or_username() {
        let me = CurrentUser::new(UserId::from(1), "alice");
        assert!(me.is(&Sender {
            id: Some(UserId::from(1)),
            username: String::new(),
        }));
        assert!(me.is(&Sender {
            id: None,
            username: "alice".into(),
        }));
        assert!(!me.is(&Sender {
            id: Some(UserId::from(2)),
            username: "bob".into(),
        }));
    }

    #[test]
    fn message_defaults_optional_fields() {
        let json = r#"{
            "id": 5,
            "sender": {"id": 1, "username": "alice"},
            "created_at": "2024-03-01T10:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.content, None);
        assert_eq!(msg.image_url, None);
        assert!(!msg.is_edited);
    }

    #[test]
    fn notification_accepts_short_field_names() {
        let json = r#"{"id": 9, "message": "hi", "type": "friend_request", "read": true}"#;
        let n: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(n.notification_type, "friend_request");
        assert!(n.is_read);
        assert!(n.invalid_reason.is_none());
    }

    #[test]
    fn conversation_title_skips_self() {
        let conv: Conversation = serde_json::from_str(
            r#"{"id": 4, "participants": [{"id": 1, "username": "alice"}, {"id": 2, "username": "bob"}]}"#,
        )
        .unwrap();
        assert_eq!(conv.title_for(&UserId::from(1)), "bob");
    }
}
