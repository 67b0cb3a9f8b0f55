//! Per-user notification feed over its own live session.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelDeps;
use crate::endpoint::ChannelTarget;
use crate::error::{ApiError, SessionError};
use crate::models::{Notification, UserId};
use crate::rest::{FriendRequestResponse, MessagingApi};
use crate::router::Handlers;
use crate::session::{Session, SessionStatus};

/// Notifications newest first, at most one per id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationList {
    items: Vec<Notification>,
}

impl NotificationList {
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn get(&self, id: i64) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.is_read).count()
    }

    /// Returns `false` for an id already present.
    pub fn insert(&mut self, notification: Notification) -> bool {
        if self.get(notification.id).is_some() {
            return false;
        }
        self.items.insert(0, notification);
        self.sort();
        true
    }

    /// Replace with a server listing, keeping local invalid annotations.
    pub fn replace_all(&mut self, notifications: Vec<Notification>) {
        let previous = std::mem::take(&mut self.items);
        for mut notification in notifications {
            if self.get(notification.id).is_some() {
                continue;
            }
            if notification.invalid_reason.is_none() {
                notification.invalid_reason = previous
                    .iter()
                    .find(|p| p.id == notification.id)
                    .and_then(|p| p.invalid_reason.clone());
            }
            self.items.push(notification);
        }
        self.sort();
    }

    pub fn annotate_invalid(&mut self, id: i64, reason: impl Into<String>) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(n) => {
                n.invalid_reason = Some(reason.into());
                true
            }
            None => false,
        }
    }

    pub fn mark_read(&mut self, id: i64) -> bool {
        match self.items.iter_mut().find(|n| n.id == id && !n.is_read) {
            Some(n) => {
                n.is_read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) -> bool {
        let mut changed = false;
        for n in self.items.iter_mut().filter(|n| !n.is_read) {
            n.is_read = true;
            changed = true;
        }
        changed
    }

    /// Id of the notification carrying friend request `request_id`.
    pub fn find_by_friend_request(&self, request_id: i64) -> Option<i64> {
        self.items
            .iter()
            .find(|n| n.friend_request_id == Some(request_id))
            .map(|n| n.id)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    // Stable, so entries without a timestamp keep arrival order at the end.
    fn sort(&mut self) {
        self.items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationSnapshot {
    pub notifications: NotificationList,
    pub unread_count: usize,
    pub status: SessionStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Received(Notification),
    Invalidated { notification_id: i64, message: String },
    Error(String),
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum Command {
    MarkAsRead { id: i64, respond_to: Reply },
    MarkAllRead { respond_to: Reply },
    Clear { respond_to: Reply },
    RespondToFriendRequest {
        request_id: i64,
        response: FriendRequestResponse,
        respond_to: Reply,
    },
    Refresh,
    NetworkOnline,
    NetworkOffline,
    Disconnect,
    Reconnect,
}

enum Inbound {
    Notification(Notification),
    Invalid(i64, String),
}

enum Completed {
    Refresh(Result<Vec<Notification>, ApiError>),
    Done {
        what: &'static str,
        result: Result<(), ApiError>,
        respond_to: Reply,
        after: AfterSuccess,
    },
}

/// Local change applied once the server accepted a request.
enum AfterSuccess {
    Nothing,
    Clear,
    MarkRead(Option<i64>),
}

pub struct NotificationFeed {
    user: UserId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<NotificationSnapshot>,
    events: broadcast::Sender<NotificationEvent>,
    cancel: CancellationToken,
}

impl NotificationFeed {
    pub fn open(user: UserId, deps: &ChannelDeps) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let on_notification = inbound_tx.clone();
        let handlers = Handlers::new()
            .on_notification(move |n| {
                let _ = on_notification.send(Inbound::Notification(n));
            })
            .on_friend_request_invalid(move |id, message| {
                let _ = inbound_tx.send(Inbound::Invalid(id, message));
            });
        let session = Session::spawn(
            deps.config.notification_session(),
            deps.connector.clone(),
            deps.credentials.clone(),
            handlers,
        );
        session.connect(ChannelTarget::Notifications(user.clone()));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(NotificationSnapshot::default());
        let (events_tx, _) = broadcast::channel(64);
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let actor = FeedActor {
            user: user.clone(),
            session,
            api: deps.api.clone(),
            list: NotificationList::default(),
            snapshot: snapshot_tx,
            events: events_tx.clone(),
            completed: completed_tx,
            last_error: None,
        };
        tokio::spawn(actor.run(cmd_rx, inbound_rx, completed_rx, cancel.clone()));

        Self {
            user,
            commands: cmd_tx,
            snapshot: snapshot_rx,
            events: events_tx,
            cancel,
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Marks locally right away; the server is told over the live channel,
    /// or over REST when the frame cannot be sent.
    pub async fn mark_as_read(&self, id: i64) -> Result<(), SessionError> {
        self.request(|respond_to| Command::MarkAsRead { id, respond_to })
            .await
    }

    pub async fn mark_all_read(&self) -> Result<(), SessionError> {
        self.request(|respond_to| Command::MarkAllRead { respond_to })
            .await
    }

    pub async fn clear(&self) -> Result<(), SessionError> {
        self.request(|respond_to| Command::Clear { respond_to }).await
    }

    pub async fn respond_to_friend_request(
        &self,
        request_id: i64,
        response: FriendRequestResponse,
    ) -> Result<(), SessionError> {
        self.request(|respond_to| Command::RespondToFriendRequest {
            request_id,
            response,
            respond_to,
        })
        .await
    }

    pub fn refresh(&self) {
        self.command(Command::Refresh);
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

    pub fn snapshot(&self) -> NotificationSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!(user = %self.user, "notification actor is gone");
        }
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct FeedActor {
    user: UserId,
    session: Session,
    api: Arc<dyn MessagingApi>,
    list: NotificationList,
    snapshot: watch::Sender<NotificationSnapshot>,
    events: broadcast::Sender<NotificationEvent>,
    completed: mpsc::UnboundedSender<Completed>,
    last_error: Option<String>,
}

impl FeedActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut completed: mpsc::UnboundedReceiver<Completed>,
        cancel: CancellationToken,
    ) {
        let mut status = self.session.subscribe();
        info!(user = %self.user, "notification feed opened");
        self.refresh();

        loop {
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
                    self.publish();
                }
            }
        }
        debug!(user = %self.user, "notification feed closed");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::MarkAsRead { id, respond_to } => {
                if self.list.mark_read(id) {
                    self.publish();
                }
                if self.session.mark_as_read(id).await {
                    let _ = respond_to.send(Ok(()));
                    return;
                }
                debug!(notification_id = id, "marking read over REST");
                let api = self.api.clone();
                self.spawn_request(
                    "mark notification read",
                    respond_to,
                    AfterSuccess::Nothing,
                    async move { api.mark_notification_read(id).await },
                );
            }
            Command::MarkAllRead { respond_to } => {
                if self.list.mark_all_read() {
                    self.publish();
                }
                let api = self.api.clone();
                self.spawn_request(
                    "mark all read",
                    respond_to,
                    AfterSuccess::Nothing,
                    async move { api.mark_all_notifications_read().await },
                );
            }
            Command::Clear { respond_to } => {
                let api = self.api.clone();
                self.spawn_request(
                    "clear notifications",
                    respond_to,
                    AfterSuccess::Clear,
                    async move { api.clear_notifications().await },
                );
            }
            Command::RespondToFriendRequest {
                request_id,
                response,
                respond_to,
            } => {
                let api = self.api.clone();
                let notification = self.list.find_by_friend_request(request_id);
                self.spawn_request(
                    "respond to friend request",
                    respond_to,
                    AfterSuccess::MarkRead(notification),
                    async move { api.respond_to_friend_request(request_id, response).await },
                );
            }
            Command::Refresh => self.refresh(),
            Command::NetworkOnline => {
                self.session.network_online();
                self.refresh();
            }
            Command::NetworkOffline => self.session.network_offline(),
            Command::Disconnect => self.session.disconnect(),
            Command::Reconnect => self.session.reconnect(),
        }
    }

    fn on_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Notification(notification) => {
                if self.list.insert(notification.clone()) {
                    debug!(notification_id = notification.id, "notification received");
                    let _ = self.events.send(NotificationEvent::Received(notification));
                    self.publish();
                }
            }
            Inbound::Invalid(id, message) => {
                if self.list.annotate_invalid(id, message.clone()) {
                    self.publish();
                }
                let _ = self.events.send(NotificationEvent::Invalidated {
                    notification_id: id,
                    message,
                });
            }
        }
    }

    fn on_completed(&mut self, done: Completed) {
        match done {
            Completed::Refresh(Ok(notifications)) => {
                self.list.replace_all(notifications);
                self.publish();
            }
            Completed::Refresh(Err(e)) => {
                warn!(user = %self.user, "notification refresh failed: {}", e);
                self.fail(format!("Failed to load notifications: {e}"));
            }
            Completed::Done {
                what,
                result,
                respond_to,
                after,
            } => {
                let reply = match result {
                    Ok(()) => {
                        let changed = match after {
                            AfterSuccess::Nothing => false,
                            AfterSuccess::Clear => {
                                self.list.clear();
                                true
                            }
                            AfterSuccess::MarkRead(Some(id)) => self.list.mark_read(id),
                            AfterSuccess::MarkRead(None) => false,
                        };
                        if changed {
                            self.publish();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        warn!(user = %self.user, "{} failed: {}", what, e);
                        self.fail(format!("Failed to {what}: {e}"));
                        Err(e.into())
                    }
                };
                let _ = respond_to.send(reply);
            }
        }
    }

    fn spawn_request<F>(&self, what: &'static str, respond_to: Reply, after: AfterSuccess, call: F)
    where
        F: std::future::Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        let completed = self.completed.clone();
        tokio::spawn(async move {
            let result = call.await;
            let _ = completed.send(Completed::Done {
                what,
                result,
                respond_to,
                after,
            });
        });
    }

    fn refresh(&self) {
        let api = self.api.clone();
        let completed = self.completed.clone();
        tokio::spawn(async move {
            let result = api.list_notifications().await;
            let _ = completed.send(Completed::Refresh(result));
        });
    }

    fn fail(&mut self, message: String) {
        let _ = self.events.send(NotificationEvent::Error(message.clone()));
        self.last_error = Some(message);
        self.publish();
    }

    fn publish(&self) {
        let next = NotificationSnapshot {
            unread_count: self.list.unread_count(),
            notifications: self.list.clone(),
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
    use chrono::{TimeZone, Utc};

    fn notification(id: i64, secs: Option<i64>) -> Notification {
        Notification {
            id,
            message: format!("n{id}"),
            notification_type: "friend_request".into(),
            is_read: false,
            created_at: secs.map(|s| Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap()),
            friend_request_id: Some(id * 10),
            invalid_reason: None,
        }
    }

    #[test]
    fn insert_dedups_and_keeps_newest_first() {
        let mut list = NotificationList::default();
        assert!(list.insert(notification(1, Some(10))));
        assert!(list.insert(notification(2, Some(20))));
        assert!(!list.insert(notification(1, Some(10))));
        let ids: Vec<i64> = list.items().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn read_tracking() {
        let mut list = NotificationList::default();
        list.insert(notification(1, Some(1)));
        list.insert(notification(2, Some(2)));
        assert_eq!(list.unread_count(), 2);
        assert!(list.mark_read(1));
        assert!(!list.mark_read(1));
        assert_eq!(list.unread_count(), 1);
        assert!(list.mark_all_read());
        assert!(!list.mark_all_read());
        assert_eq!(list.unread_count(), 0);
    }

    #[test]
    fn replace_all_keeps_invalid_annotation() {
        let mut list = NotificationList::default();
        list.insert(notification(1, Some(1)));
        assert!(list.annotate_invalid(1, "request was cancelled"));
        list.replace_all(vec![
            notification(1, Some(1)),
            notification(3, Some(3)),
            notification(3, Some(3)),
        ]);
        assert_eq!(list.len(), 2);
        assert_eq!(
            list.get(1).and_then(|n| n.invalid_reason.as_deref()),
            Some("request was cancelled")
        );
    }

    #[test]
    fn finds_notification_by_friend_request() {
        let mut list = NotificationList::default();
        list.insert(notification(4, None));
        assert_eq!(list.find_by_friend_request(40), Some(4));
        assert_eq!(list.find_by_friend_request(41), None);
    }
}
