//! Agora Live - real-time messaging and notification sessions
//!
//! This crate owns the client side of Agora's live channels: one WebSocket
//! session per conversation or per user notification feed, with heartbeat,
//! exponential-backoff reconnection, typed frame routing, optimistic message
//! reconciliation and typing indicators. REST calls are only used as a
//! fallback when the live channel cannot deliver.
//!
//! It has no UI knowledge. Presentation code drives a [`ConversationChannel`]
//! or [`NotificationFeed`] through plain method calls and renders the
//! snapshots they publish.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use agora_live::{
//!     ChannelDeps, ConversationChannel, ConversationId, CurrentUser, HttpApi, LiveConfig,
//!     StaticCredentials, UserId, WsConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LiveConfig::for_api_base("https://social.example.com/api");
//!     let credentials = Arc::new(StaticCredentials::new("token"));
//!     let api = Arc::new(HttpApi::new(&config.api_base_url, credentials.clone()));
//!     let deps = ChannelDeps::new(config, Arc::new(WsConnector), credentials, api);
//!
//!     let me = CurrentUser::new(UserId::from("7"), "alice");
//!     let channel = ConversationChannel::open(ConversationId::from("42"), me, &deps);
//!
//!     channel.send("hello").await.unwrap();
//!     let mut snapshots = channel.subscribe();
//!     while snapshots.changed().await.is_ok() {
//!         for entry in &snapshots.borrow().messages {
//!             println!("{}: {}", entry.sender.username, entry.text());
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod conversation;
pub mod credentials;
pub mod endpoint;
mod error;
pub mod models;
pub mod notifications;
pub mod policy;
pub mod protocol;
pub mod rest;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;
pub mod typing;

pub use config::{ChannelDeps, LiveConfig};
pub use conversation::{ConversationChannel, ConversationEvent, ConversationSnapshot};
pub use credentials::{CredentialProvider, SharedToken, StaticCredentials};
pub use endpoint::{ChannelTarget, RealtimeEndpoint};
pub use error::{ApiError, ProtocolError, SessionError, TransportError};
pub use models::{
    Conversation, ConversationId, CurrentUser, Message, Notification, Participant, Sender, UserId,
};
pub use notifications::{
    NotificationEvent, NotificationFeed, NotificationList, NotificationSnapshot,
};
pub use policy::{CloseCode, ConnectionFailure, ConnectionState, ReconnectPolicy};
pub use protocol::{InboundFrame, OutboundFrame};
pub use rest::{FriendRequestResponse, HttpApi, ImageUpload, MessagingApi};
pub use router::{Handlers, HandlerSlot, MessageRouter};
pub use session::{ConnectionIndicator, Session, SessionConfig, SessionStatus};
pub use store::{Draft, Entry, EntryId, MessageStore, Reconciled, Viewport};
pub use transport::{Connector, WsConnector};
pub use typing::{TypingAggregator, TypingUser};
