//! JSON frames exchanged over the live channel.
//!
//! Every frame is an object tagged by `type`. Unknown inbound types decode
//! to [`InboundFrame::Unknown`] so the router can log and skip them.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{Message, Notification, UserId};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    ConnectionEstablished,
    Message {
        message: Message,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        message_id: i64,
    },
    Typing {
        user_id: UserId,
        #[serde(default)]
        username: String,
        is_typing: bool,
    },
    Pong,
    Notification {
        notification: Notification,
    },
    UnreadNotifications {
        #[serde(default)]
        notifications: Vec<Notification>,
    },
    FriendRequestInvalid {
        notification_id: i64,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "connection_established",
            Self::Message { .. } => "message",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::Typing { .. } => "typing",
            Self::Pong => "pong",
            Self::Notification { .. } => "notification",
            Self::UnreadNotifications { .. } => "unread_notifications",
            Self::FriendRequestInvalid { .. } => "friend_request_invalid",
            Self::Unknown => "unknown",
        }
    }
}

/// Body of an outbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ping { timestamp: i64 },
    Message { message: OutgoingMessage },
    Typing { is_typing: bool },
    MarkAsRead { notification_id: i64 },
}

impl OutboundFrame {
    pub fn ping_now() -> Self {
        Self::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            message: OutgoingMessage {
                content: content.into(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
