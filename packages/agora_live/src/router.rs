//! Dispatch of decoded frames to registered callbacks.
//!
//! Callbacks live in a [`HandlerSlot`] that is read at dispatch time, so the
//! owner can swap them without reconnecting and the latest set always wins.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::models::{Message, Notification, UserId};
use crate::policy::CloseCode;
use crate::protocol::{InboundFrame, parse_frame};

type Callback<T> = Option<Arc<dyn Fn(T) + Send + Sync>>;

/// Callbacks keyed by frame type, plus connection lifecycle hooks.
#[derive(Default, Clone)]
pub struct Handlers {
    on_connection_established: Callback<()>,
    on_message: Callback<Message>,
    on_message_edited: Callback<Message>,
    on_message_deleted: Callback<i64>,
    on_typing: Callback<(UserId, String, bool)>,
    on_pong: Callback<()>,
    on_notification: Callback<Notification>,
    on_friend_request_invalid: Callback<(i64, String)>,
    on_open: Callback<()>,
    on_close: Callback<CloseCode>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_connection_established", &self.on_connection_established.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_message_edited", &self.on_message_edited.is_some())
            .field("on_message_deleted", &self.on_message_deleted.is_some())
            .field("on_typing", &self.on_typing.is_some())
            .field("on_pong", &self.on_pong.is_some())
            .field("on_notification", &self.on_notification.is_some())
            .field("on_friend_request_invalid", &self.on_friend_request_invalid.is_some())
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection_established<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connection_established = Some(Arc::new(move |()| f()));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_message_edited<F>(mut self, f: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_message_edited = Some(Arc::new(f));
        self
    }

    pub fn on_message_deleted<F>(mut self, f: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.on_message_deleted = Some(Arc::new(f));
        self
    }

    /// Called with `(user_id, username, is_typing)`.
    pub fn on_typing<F>(mut self, f: F) -> Self
    where
        F: Fn(UserId, String, bool) + Send + Sync + 'static,
    {
        self.on_typing = Some(Arc::new(move |(user, name, typing): (UserId, String, bool)| {
            f(user, name, typing)
        }));
        self
    }

    pub fn on_pong<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_pong = Some(Arc::new(move |()| f()));
        self
    }

    /// Called for pushed notifications and for every unread notification
    /// delivered on connect.
    pub fn on_notification<F>(mut self, f: F) -> Self
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.on_notification = Some(Arc::new(f));
        self
    }

    /// Called with `(notification_id, message)`.
    pub fn on_friend_request_invalid<F>(mut self, f: F) -> Self
    where
        F: Fn(i64, String) + Send + Sync + 'static,
    {
        self.on_friend_request_invalid = Some(Arc::new(move |(id, msg): (i64, String)| f(id, msg)));
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(move |()| f()));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(CloseCode) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }
}

/// Shared, replaceable handler set.
#[derive(Clone, Default, Debug)]
pub struct HandlerSlot(Arc<RwLock<Handlers>>);

impl HandlerSlot {
    pub fn new(handlers: Handlers) -> Self {
        Self(Arc::new(RwLock::new(handlers)))
    }

    pub fn replace(&self, handlers: Handlers) {
        *self.0.write() = handlers;
    }

    // Clone the callback out so it runs without the lock held and may
    // replace the handlers itself.
    fn get<T>(&self, pick: impl FnOnce(&Handlers) -> &Callback<T>) -> Callback<T> {
        let handlers = self.0.read();
        pick(&handlers).clone()
    }
}

#[derive(Clone, Debug)]
pub struct MessageRouter {
    slot: HandlerSlot,
}

impl MessageRouter {
    pub fn new(slot: HandlerSlot) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &HandlerSlot {
        &self.slot
    }

    /// Parse and dispatch. Malformed text is returned as an error and
    /// invokes nothing.
    pub fn dispatch_text(&self, text: &str) -> Result<bool, ProtocolError> {
        let frame = parse_frame(text)?;
        Ok(self.dispatch(frame))
    }

    /// Returns whether a handler ran.
    pub fn dispatch(&self, frame: InboundFrame) -> bool {
        match frame {
            InboundFrame::ConnectionEstablished => {
                call(self.slot.get(|h| &h.on_connection_established), ())
            }
            InboundFrame::Message { message } => call(self.slot.get(|h| &h.on_message), message),
            InboundFrame::MessageEdited { message } => {
                call(self.slot.get(|h| &h.on_message_edited), message)
            }
            InboundFrame::MessageDeleted { message_id } => {
                call(self.slot.get(|h| &h.on_message_deleted), message_id)
            }
            InboundFrame::Typing {
                user_id,
                username,
                is_typing,
            } => call(self.slot.get(|h| &h.on_typing), (user_id, username, is_typing)),
            InboundFrame::Pong => call(self.slot.get(|h| &h.on_pong), ()),
            InboundFrame::Notification { notification } => {
                call(self.slot.get(|h| &h.on_notification), notification)
            }
            InboundFrame::UnreadNotifications { notifications } => {
                let Some(cb) = self.slot.get(|h| &h.on_notification) else {
                    return false;
                };
                debug!(count = notifications.len(), "delivering unread notifications");
                for notification in notifications {
                    cb(notification);
                }
                true
            }
            InboundFrame::FriendRequestInvalid {
                notification_id,
                message,
            } => call(
                self.slot.get(|h| &h.on_friend_request_invalid),
                (notification_id, message),
            ),
            InboundFrame::Unknown => {
                warn!("ignoring frame with unknown type");
                false
            }
        }
    }

    pub fn opened(&self) {
        call(self.slot.get(|h| &h.on_open), ());
    }

    pub fn closed(&self, code: CloseCode) {
        call(self.slot.get(|h| &h.on_close), code);
    }
}

fn call<T>(cb: Callback<T>, arg: T) -> bool {
    match cb {
        Some(cb) => {
            cb(arg);
            true
        }
        None => false,
    }
}
