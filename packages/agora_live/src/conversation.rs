//! Conversation channel: the live session, the message store and typing
//! state for one conversation, behind a single actor.
//!
//! Sends go over the live channel when it is open and fall back to REST
//! otherwise (and always for images). While the channel is down the full
//! message list is polled so nothing is missed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ChannelDeps, LiveConfig};
use crate::endpoint::ChannelTarget;
use crate::error::{ApiError, SessionError};
use crate::models::{ConversationId, CurrentUser, Message, UserId};
use crate::policy::CloseCode;
use crate::rest::{ImageUpload, MessagingApi};
use crate::router::Handlers;
use crate::session::{ConnectionIndicator, Session, SessionStatus, sleep_until, tick};
use crate::store::{Draft, Entry, MessageStore, Reconciled, Viewport};
use crate::typing::{TypingAggregator, TypingUser};

/// Render-ready state of a conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSnapshot {
    pub messages: Vec<Entry>,
    pub typing: Vec<TypingUser>,
    pub typing_summary: Option<String>,
    pub status: SessionStatus,
    pub last_error: Option<String>,
}

impl ConversationSnapshot {
    pub fn indicator(&self) -> ConnectionIndicator {
        self.status.indicator()
    }
}

/// One-off signals for the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    ScrollToBottom,
    Failed { temp_id: u64 },
    Error(String),
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Send {
        draft: Draft,
        image: Option<ImageUpload>,
        respond_to: Reply<u64>,
    },
    Resend {
        temp_id: u64,
        respond_to: Reply<u64>,
    },
    Edit {
        message_id: i64,
        content: String,
        respond_to: Reply<()>,
    },
    Delete {
        message_id: i64,
        respond_to: Reply<()>,
    },
    Keystroke,
    SetViewport(Viewport),
    Reload,
    NetworkOnline,
    NetworkOffline,
    Disconnect,
    Reconnect,
}

/// Frames forwarded from the session's router.
enum Inbound {
    Message(Message),
    Edited(Message),
    Deleted(i64),
    Typing(UserId, String, bool),
    Closed(CloseCode),
}

/// Results of spawned REST calls.
enum Completed {
    Send {
        temp_id: u64,
        /// The live channel refused the frame before REST took over.
        live_failed: bool,
        result: Result<Message, ApiError>,
        respond_to: Reply<u64>,
    },
    Reload(Result<Vec<Message>, ApiError>),
    Edit {
        result: Result<Message, ApiError>,
        respond_to: Reply<()>,
    },
    Delete {
        message_id: i64,
        result: Result<(), ApiError>,
        respond_to: Reply<()>,
    },
}

/// Handle to a conversation actor. Dropping it closes the live channel.
pub struct ConversationChannel {
    conversation: ConversationId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ConversationSnapshot>,
    events: broadcast::Sender<ConversationEvent>,
    cancel: CancellationToken,
}

impl ConversationChannel {
    /// Connect to `conversation` and load its messages.
    pub fn open(conversation: ConversationId, me: CurrentUser, deps: &ChannelDeps) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            deps.config.conversation_session(),
            deps.connector.clone(),
            deps.credentials.clone(),
            forwarding_handlers(inbound_tx),
        );
        session.connect(ChannelTarget::Conversation(conversation.clone()));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConversationSnapshot::default());
        let (events_tx, _) = broadcast::channel(64);
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let config = deps.config.clone();
        let actor = ConversationActor {
            conversation: conversation.clone(),
            store: MessageStore::with_timeout(me.clone(), config.send_timeout),
            typing: TypingAggregator::new(config.typing_expiry),
            me,
            session,
            api: deps.api.clone(),
            snapshot: snapshot_tx,
            events: events_tx.clone(),
            completed: completed_tx,
            viewport: Viewport::pinned(),
            last_error: None,
            images: HashMap::new(),
            reloading: false,
            reload_at: None,
            poll: Some(poll_interval(&config)),
            typing_stop_at: None,
            config,
        };
        tokio::spawn(actor.run(cmd_rx, inbound_rx, completed_rx, cancel.clone()));

        Self {
            conversation,
            commands: cmd_tx,
            snapshot: snapshot_rx,
            events: events_tx,
            cancel,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.conversation
    }

    /// Send a text message. Resolves with the temporary id once the message
    /// is on its way; a REST fallback failure is returned as `Err` and the
    /// entry is flagged failed.
    pub async fn send(&self, content: impl Into<String>) -> Result<u64, SessionError> {
        let draft = Draft::text(content);
        self.request(|respond_to| Command::Send {
            draft,
            image: None,
            respond_to,
        })
        .await
    }

    /// Images always go over REST.
    pub async fn send_with_image(
        &self,
        content: impl Into<String>,
        image: ImageUpload,
    ) -> Result<u64, SessionError> {
        let draft = Draft {
            content: content.into(),
            image_url: Some(image.file_name.clone()),
        };
        self.request(|respond_to| Command::Send {
            draft,
            image: Some(image),
            respond_to,
        })
        .await
    }

    /// Retry a failed message. The failed entry is replaced by a new one.
    pub async fn resend(&self, temp_id: u64) -> Result<u64, SessionError> {
        self.request(|respond_to| Command::Resend {
            temp_id,
            respond_to,
        })
        .await
    }

    pub async fn edit(&self, message_id: i64, content: impl Into<String>) -> Result<(), SessionError> {
        let content = content.into();
        self.request(|respond_to| Command::Edit {
            message_id,
            content,
            respond_to,
        })
        .await
    }

    pub async fn delete(&self, message_id: i64) -> Result<(), SessionError> {
        self.request(|respond_to| Command::Delete {
            message_id,
            respond_to,
        })
        .await
    }

    /// The user typed something.
    pub fn keystroke(&self) {
        self.command(Command::Keystroke);
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.command(Command::SetViewport(viewport));
    }

    pub fn reload(&self) {
        self.command(Command::Reload);
    }

    pub fn network_online(&self) {
        self.command(Command::NetworkOnline);
    }

    pub fn network_offline(&self) {
        self.command(Command::NetworkOffline);
    }

    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!(conversation = %self.conversation, "conversation actor is gone");
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl Drop for ConversationChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn forwarding_handlers(tx: mpsc::UnboundedSender<Inbound>) -> Handlers {
    let on_message = tx.clone();
    let on_edited = tx.clone();
    let on_deleted = tx.clone();
    let on_typing = tx.clone();
    Handlers::new()
        .on_message(move |m| {
            let _ = on_message.send(Inbound::Message(m));
        })
        .on_message_edited(move |m| {
            let _ = on_edited.send(Inbound::Edited(m));
        })
        .on_message_deleted(move |id| {
            let _ = on_deleted.send(Inbound::Deleted(id));
        })
        .on_typing(move |user, name, typing| {
            let _ = on_typing.send(Inbound::Typing(user, name, typing));
        })
        .on_close(move |code| {
            let _ = tx.send(Inbound::Closed(code));
        })
}

fn poll_interval(config: &LiveConfig) -> Interval {
    let mut interval =
        tokio::time::interval_at(Instant::now() + config.poll_interval, config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

struct ConversationActor {
    conversation: ConversationId,
    me: CurrentUser,
    config: LiveConfig,
    session: Session,
    store: MessageStore,
    typing: TypingAggregator,
    api: Arc<dyn MessagingApi>,
    snapshot: watch::Sender<ConversationSnapshot>,
    events: broadcast::Sender<ConversationEvent>,
    completed: mpsc::UnboundedSender<Completed>,
    viewport: Viewport,
    last_error: Option<String>,
    /// Attachments of in-flight or failed image sends, for resend.
    images: HashMap<u64, ImageUpload>,
    reloading: bool,
    reload_at: Option<Instant>,
    poll: Option<Interval>,
    typing_stop_at: Option<Instant>,
}

impl ConversationActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut completed: mpsc::UnboundedReceiver<Completed>,
        cancel: CancellationToken,
    ) {
        let mut status = self.session.subscribe();
        info!(conversation = %self.conversation, "conversation channel opened");
        self.start_reload();
        self.publish();

        loop {
            let deadline = earliest(self.store.next_deadline(), self.typing.next_deadline());
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                Some(event) = inbound.recv() => self.on_inbound(event),

                Some(done) = completed.recv() => self.on_completed(done),

                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    self.on_status(current);
                }

                _ = sleep_until(deadline) => self.expire(Instant::now()),

                _ = sleep_until(self.reload_at) => {
                    self.reload_at = None;
                    self.start_reload();
                }

                _ = sleep_until(self.typing_stop_at) => {
                    self.typing_stop_at = None;
                    self.session.send_typing(false);
                }

                _ = tick(&mut self.poll) => {
                    debug!(conversation = %self.conversation, "polling while disconnected");
                    self.start_reload();
                }
            }
        }
        debug!(conversation = %self.conversation, "conversation channel closed");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                draft,
                image,
                respond_to,
            } => self.send(draft, image, respond_to).await,
            Command::Resend {
                temp_id,
                respond_to,
            } => match self.store.take_failed(temp_id) {
                Some(draft) => {
                    let image = self.images.remove(&temp_id);
                    self.send(draft, image, respond_to).await;
                }
                None => {
                    let _ = respond_to.send(Err(SessionError::NotFailed { temp_id }));
                }
            },
            Command::Edit {
                message_id,
                content,
                respond_to,
            } => {
                let api = self.api.clone();
                let conversation = self.conversation.clone();
                let completed = self.completed.clone();
                tokio::spawn(async move {
                    let result = api.edit_message(&conversation, message_id, &content).await;
                    let _ = completed.send(Completed::Edit { result, respond_to });
                });
            }
            Command::Delete {
                message_id,
                respond_to,
            } => {
                let api = self.api.clone();
                let conversation = self.conversation.clone();
                let completed = self.completed.clone();
                tokio::spawn(async move {
                    let result = api.delete_message(&conversation, message_id).await;
                    let _ = completed.send(Completed::Delete {
                        message_id,
                        result,
                        respond_to,
                    });
                });
            }
            Command::Keystroke => {
                if self.session.is_open() {
                    self.session.send_typing(true);
                    self.typing_stop_at = Some(Instant::now() + self.config.typing_idle);
                }
            }
            Command::SetViewport(viewport) => self.viewport = viewport,
            Command::Reload => self.start_reload(),
            Command::NetworkOnline => {
                self.session.network_online();
                self.start_reload();
            }
            Command::NetworkOffline => self.session.network_offline(),
            Command::Disconnect => {
                self.typing_stop_at = None;
                self.session.disconnect();
                if self.typing.clear() {
                    self.publish();
                }
            }
            Command::Reconnect => self.session.reconnect(),
        }
    }

    async fn send(&mut self, mut draft: Draft, image: Option<ImageUpload>, respond_to: Reply<u64>) {
        draft.content = draft.content.trim().to_string();
        if draft.content.is_empty() && image.is_none() {
            let _ = respond_to.send(Err(SessionError::EmptyMessage));
            return;
        }

        let content = draft.content.clone();
        let temp_id = self.store.append_optimistic(draft, Instant::now());
        self.emit(ConversationEvent::ScrollToBottom);
        self.publish();

        if self.typing_stop_at.take().is_some() {
            self.session.send_typing(false);
        }

        if image.is_none() && self.session.send_message(&content).await {
            debug!(conversation = %self.conversation, temp_id, "sent over live channel");
            let _ = respond_to.send(Ok(temp_id));
            return;
        }

        let live_failed = image.is_none();
        debug!(conversation = %self.conversation, temp_id, live_failed, "sending over REST");
        if let Some(image) = &image {
            self.images.insert(temp_id, image.clone());
        }
        let api = self.api.clone();
        let conversation = self.conversation.clone();
        let completed = self.completed.clone();
        tokio::spawn(async move {
            let result = api.send_message(&conversation, &content, image).await;
            let _ = completed.send(Completed::Send {
                temp_id,
                live_failed,
                result,
                respond_to,
            });
        });
    }

    fn on_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Message(message) => self.reconcile(message),
            Inbound::Edited(message) => {
                if self.store.apply_edit(&message) {
                    self.publish();
                }
            }
            Inbound::Deleted(id) => {
                if self.store.apply_delete(id) {
                    self.publish();
                }
            }
            Inbound::Typing(user_id, username, is_typing) => {
                if user_id == self.me.id {
                    return;
                }
                if self
                    .typing
                    .set_typing(user_id, username, is_typing, Instant::now())
                {
                    self.publish();
                }
            }
            Inbound::Closed(code) => {
                debug!(conversation = %self.conversation, code = %code, "live channel closed");
                if self.typing.clear() {
                    self.publish();
                }
            }
        }
    }

    fn reconcile(&mut self, message: Message) {
        match self.store.reconcile_incoming(message, &self.viewport) {
            Reconciled::Duplicate => {}
            Reconciled::Confirmed { .. } => self.publish(),
            Reconciled::Appended { scroll, .. } => {
                if scroll {
                    self.emit(ConversationEvent::ScrollToBottom);
                }
                self.publish();
            }
        }
    }

    fn on_completed(&mut self, done: Completed) {
        match done {
            Completed::Send {
                temp_id,
                live_failed,
                result,
                respond_to,
            } => match result {
                Ok(message) => {
                    self.images.remove(&temp_id);
                    self.reconcile(message);
                    if live_failed || !self.session.is_open() {
                        self.reload_at = Some(Instant::now() + self.config.fallback_reload_delay);
                    }
                    let _ = respond_to.send(Ok(temp_id));
                }
                Err(e) => {
                    warn!(conversation = %self.conversation, temp_id, "REST send failed: {}", e);
                    self.store.mark_failed(temp_id);
                    self.fail(format!("Failed to send message: {e}"));
                    self.emit(ConversationEvent::Failed { temp_id });
                    let _ = respond_to.send(Err(e.into()));
                }
            },
            Completed::Reload(result) => {
                self.reloading = false;
                match result {
                    Ok(messages) => {
                        debug!(conversation = %self.conversation, count = messages.len(), "messages reloaded");
                        self.store.replace_all(messages);
                        self.emit(ConversationEvent::ScrollToBottom);
                        self.publish();
                        self.mark_read();
                    }
                    Err(e) => {
                        // Keep whatever is already shown.
                        warn!(conversation = %self.conversation, "reload failed: {}", e);
                        self.fail(format!("Failed to load messages: {e}"));
                    }
                }
            }
            Completed::Edit { result, respond_to } => {
                let reply = match result {
                    Ok(message) => {
                        if self.store.apply_edit(&message) {
                            self.publish();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.fail(format!("Failed to edit message: {e}"));
                        Err(e.into())
                    }
                };
                let _ = respond_to.send(reply);
            }
            Completed::Delete {
                message_id,
                result,
                respond_to,
            } => {
                let reply = match result {
                    Ok(()) => {
                        if self.store.apply_delete(message_id) {
                            self.publish();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.fail(format!("Failed to delete message: {e}"));
                        Err(e.into())
                    }
                };
                let _ = respond_to.send(reply);
            }
        }
    }

    fn on_status(&mut self, status: SessionStatus) {
        if status.is_open() {
            self.poll = None;
        } else if self.poll.is_none() {
            self.poll = Some(poll_interval(&self.config));
        }
        if !status.is_open() {
            self.typing_stop_at = None;
        }
        self.publish();
    }

    fn expire(&mut self, now: Instant) {
        let failed = self.store.expire_due(now);
        for &temp_id in &failed {
            warn!(conversation = %self.conversation, temp_id, "message not confirmed in time");
            self.emit(ConversationEvent::Failed { temp_id });
            let err = SessionError::SendTimeout {
                temp_id,
                timeout: self.config.send_timeout,
            };
            self.fail(err.to_string());
        }
        let typing_changed = self.typing.expire_due(now);
        if typing_changed {
            self.publish();
        }
    }

    fn start_reload(&mut self) {
        if self.reloading {
            return;
        }
        self.reloading = true;
        let api = self.api.clone();
        let conversation = self.conversation.clone();
        let completed = self.completed.clone();
        tokio::spawn(async move {
            let result = api.list_messages(&conversation, 1).await;
            let _ = completed.send(Completed::Reload(result));
        });
    }

    fn mark_read(&self) {
        let api = self.api.clone();
        let conversation = self.conversation.clone();
        tokio::spawn(async move {
            if let Err(e) = api.mark_conversation_read(&conversation).await {
                debug!(conversation = %conversation, "mark read failed: {}", e);
            }
        });
    }

    fn fail(&mut self, message: String) {
        self.emit(ConversationEvent::Error(message.clone()));
        self.last_error = Some(message);
        self.publish();
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let next = ConversationSnapshot {
            messages: self.store.entries().to_vec(),
            typing: self.typing.users(),
            typing_summary: self.typing.summary(),
            status: self.session.status(),
            last_error: self.last_error.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_picks_the_sooner_deadline() {
        let now = Instant::now();
        let later = now + std::time::Duration::from_secs(1);
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(None, None), None);
    }

    #[test]
    fn snapshot_indicator_follows_status() {
        let snapshot = ConversationSnapshot::default();
        assert_eq!(snapshot.indicator(), ConnectionIndicator::Offline);
    }
}
