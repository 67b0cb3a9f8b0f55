//! Connection session: one live transport per target.
//!
//! A [`Session`] is a handle to an actor task that owns the transport, the
//! heartbeat, and the reconnect timer. Callers drive it with plain method
//! calls and observe it through a `watch` of [`SessionStatus`]. Inbound
//! frames are decoded and handed to the [`MessageRouter`] in delivery order.
//!
//! Dropping the handle tears everything down: the transport is closed with
//! 1000 and no timer survives.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialProvider;
use crate::endpoint::{ChannelTarget, RealtimeEndpoint};
use crate::error::{SessionError, TransportError};
use crate::models::ConversationId;
use crate::policy::{CloseCode, CloseDecision, ConnectionFailure, ConnectionState, ReconnectPolicy};
use crate::protocol::OutboundFrame;
use crate::router::{HandlerSlot, Handlers, MessageRouter};
use crate::transport::{Connector, TransportLink, WireEvent};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: RealtimeEndpoint,
    pub policy: ReconnectPolicy,
    /// Ping period while open. `None` disables the heartbeat.
    pub heartbeat: Option<Duration>,
}

impl SessionConfig {
    pub fn conversation(endpoint: RealtimeEndpoint) -> Self {
        Self {
            endpoint,
            policy: ReconnectPolicy::conversation(),
            heartbeat: Some(Duration::from_secs(20)),
        }
    }

    pub fn notifications(endpoint: RealtimeEndpoint) -> Self {
        Self {
            endpoint,
            policy: ReconnectPolicy::notifications(),
            heartbeat: None,
        }
    }
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub target: Option<ChannelTarget>,
    /// Reconnect attempts since the last successful open.
    pub attempt: u32,
    /// Delay of the scheduled reconnect, if any.
    pub backoff: Option<Duration>,
    pub error: Option<ConnectionFailure>,
}

impl SessionStatus {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// The reason the session gave up, for sessions that will not retry on
    /// their own.
    pub fn failure(&self) -> Option<SessionError> {
        match self.error? {
            ConnectionFailure::AuthenticationFailed => Some(SessionError::Auth),
            ConnectionFailure::MaxReconnectAttemptsReached => Some(SessionError::ExhaustedRetries {
                attempts: self.attempt,
            }),
            _ => None,
        }
    }

    pub fn indicator(&self) -> ConnectionIndicator {
        match self.state {
            ConnectionState::Open => ConnectionIndicator::Connected,
            ConnectionState::Connecting => ConnectionIndicator::Connecting,
            _ if self.backoff.is_some() => ConnectionIndicator::Connecting,
            _ => match self.error {
                Some(ConnectionFailure::ClosedNormally) | None => ConnectionIndicator::Offline,
                Some(_) => ConnectionIndicator::Error,
            },
        }
    }
}

/// Coarse connection status for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIndicator {
    Connected,
    Connecting,
    Error,
    Offline,
}

impl ConnectionIndicator {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Connecting => "Connecting...",
            Self::Error => "Connection error",
            Self::Offline => "Disconnected",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Self::Connected => "green",
            Self::Connecting => "yellow",
            Self::Error => "red",
            Self::Offline => "gray",
        }
    }
}

enum Command {
    Connect(ChannelTarget),
    Disconnect,
    Reconnect,
    Send {
        frame: OutboundFrame,
        respond_to: Option<oneshot::Sender<bool>>,
    },
    NetworkOnline,
    NetworkOffline,
}

/// Handle to a running session actor.
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    handlers: HandlerSlot,
    cancel: CancellationToken,
}

impl Session {
    /// Spawn the actor. It stays `Idle` until [`Session::connect`].
    pub fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        handlers: Handlers,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let slot = HandlerSlot::new(handlers);
        let cancel = CancellationToken::new();

        let actor = SessionActor {
            config,
            connector,
            credentials,
            router: MessageRouter::new(slot.clone()),
            status: status_tx,
            cancel: cancel.clone(),
            target: None,
            state: ConnectionState::Idle,
            link: None,
            pending: None,
            attempt: 0,
            backoff: None,
            error: None,
            reconnect_at: None,
            heartbeat: None,
            manually_closed: false,
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            commands: cmd_tx,
            status: status_rx,
            handlers: slot,
            cancel,
        }
    }

    pub fn connect(&self, target: ChannelTarget) {
        self.command(Command::Connect(target));
    }

    /// Shorthand for a conversation target.
    pub fn connect_conversation(&self, id: ConversationId) {
        self.connect(ChannelTarget::Conversation(id));
    }

    /// Close with 1000 and stay closed until `connect` or `reconnect`.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Reconnect to the last target now, with a fresh attempt budget.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Returns `false` when the frame could not be handed to an open
    /// transport, so the caller can fall back to REST.
    pub async fn send(&self, frame: OutboundFrame) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Send {
                frame,
                respond_to: Some(tx),
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn send_message(&self, content: &str) -> bool {
        self.send(OutboundFrame::message(content)).await
    }

    /// Best effort; dropped unless open.
    pub fn send_typing(&self, is_typing: bool) {
        self.command(Command::Send {
            frame: OutboundFrame::Typing { is_typing },
            respond_to: None,
        });
    }

    pub async fn mark_as_read(&self, notification_id: i64) -> bool {
        self.send(OutboundFrame::MarkAsRead { notification_id })
            .await
    }

    /// The host regained connectivity. Reconnects at once when the session
    /// is idle and was not closed by hand.
    pub fn network_online(&self) {
        self.command(Command::NetworkOnline);
    }

    pub fn network_offline(&self) {
        self.command(Command::NetworkOffline);
    }

    /// Swap the callbacks without touching the connection.
    pub fn set_handlers(&self, handlers: Handlers) {
        self.handlers.replace(handlers);
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn is_open(&self) -> bool {
        self.status.borrow().is_open()
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("session actor is gone, dropping command");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum AttemptError {
    MissingCredentials,
    Transport(TransportError),
}

type PendingConnect = BoxFuture<'static, Result<TransportLink, AttemptError>>;

struct SessionActor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    router: MessageRouter,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,

    target: Option<ChannelTarget>,
    state: ConnectionState,
    link: Option<TransportLink>,
    pending: Option<PendingConnect>,
    attempt: u32,
    backoff: Option<Duration>,
    error: Option<ConnectionFailure>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    manually_closed: bool,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.teardown();
                    break;
                }

                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.teardown();
                            break;
                        }
                    }
                }

                result = poll_pending(&mut self.pending) => self.on_connect_result(result),

                event = recv_inbound(&mut self.link) => self.on_wire_event(event),

                _ = tick(&mut self.heartbeat) => self.send_ping(),

                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt();
                }
            }
        }
        debug!("session actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(target) => self.connect(target),
            Command::Disconnect => self.disconnect(),
            Command::Reconnect => {
                let Some(target) = self.target.clone() else {
                    debug!("reconnect requested without a target");
                    return;
                };
                info!(channel = %target, "manual reconnect");
                self.manually_closed = false;
                self.drop_connection(CloseCode::NORMAL, "Reconnecting");
                self.attempt = 0;
                self.start_attempt();
            }
            Command::Send { frame, respond_to } => {
                let sent = self.send_frame(&frame);
                if let Some(tx) = respond_to {
                    let _ = tx.send(sent);
                }
            }
            Command::NetworkOnline => {
                if self.error == Some(ConnectionFailure::NetworkOffline) {
                    self.error = None;
                }
                let active = matches!(
                    self.state,
                    ConnectionState::Open | ConnectionState::Connecting
                );
                if !active && self.target.is_some() && !self.manually_closed {
                    info!("network back online, reconnecting");
                    self.attempt = 0;
                    self.start_attempt();
                } else {
                    self.publish();
                }
            }
            Command::NetworkOffline => {
                warn!("network offline");
                self.error = Some(ConnectionFailure::NetworkOffline);
                self.publish();
            }
        }
    }

    fn connect(&mut self, target: ChannelTarget) {
        if !target.is_valid() {
            warn!(channel = %target, "refusing to connect to an empty target");
            // The previous channel is abandoned rather than left running
            // behind an Idle status.
            let had_link = self.link.is_some();
            self.drop_connection(CloseCode::NORMAL, "Target changed");
            self.target = None;
            self.attempt = 0;
            self.backoff = None;
            self.state = ConnectionState::Idle;
            self.error = Some(ConnectionFailure::MissingCredentials);
            self.publish();
            if had_link {
                self.router.closed(CloseCode::NORMAL);
            }
            return;
        }

        if self.target.as_ref() == Some(&target) {
            if matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                debug!(channel = %target, "already connected or connecting");
                return;
            }
        } else if self.target.is_some() {
            info!(channel = %target, "switching target");
            self.drop_connection(CloseCode::NORMAL, "Target changed");
            self.attempt = 0;
        }

        self.target = Some(target);
        self.manually_closed = false;
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.reconnect_at = None;
        self.backoff = None;
        if let Some(link) = self.link.take() {
            link.close(CloseCode::NORMAL, "Reconnecting");
        }
        self.heartbeat = None;

        self.state = ConnectionState::Connecting;
        self.publish();
        debug!(channel = %target, attempt = self.attempt, "connecting");

        let credentials = self.credentials.clone();
        let connector = self.connector.clone();
        let endpoint = self.config.endpoint.clone();
        self.pending = Some(
            async move {
                let token = credentials
                    .token()
                    .await
                    .filter(|t| !t.is_empty())
                    .ok_or(AttemptError::MissingCredentials)?;
                let url = endpoint.url_for(&target, &token);
                connector
                    .connect(&url)
                    .await
                    .map_err(AttemptError::Transport)
            }
            .boxed(),
        );
    }

    fn on_connect_result(&mut self, result: Result<TransportLink, AttemptError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.state = ConnectionState::Open;
                self.attempt = 0;
                self.backoff = None;
                self.error = None;
                self.heartbeat = self.config.heartbeat.map(|period| {
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval
                });
                if let Some(target) = &self.target {
                    info!(channel = %target, "session open");
                }
                self.publish();
                self.router.opened();
            }
            Err(AttemptError::MissingCredentials) => {
                warn!("no token available, staying idle");
                self.state = ConnectionState::Idle;
                self.error = Some(ConnectionFailure::MissingCredentials);
                self.publish();
            }
            Err(AttemptError::Transport(e)) => {
                warn!("connect failed: {}", e);
                self.on_closed(CloseCode::ABNORMAL, &e.to_string());
            }
        }
    }

    fn on_wire_event(&mut self, event: Option<WireEvent>) {
        match event {
            Some(WireEvent::Text(text)) => match self.router.dispatch_text(&text) {
                Ok(true) => {}
                Ok(false) => debug!("no handler for frame"),
                Err(e) => error!("dropping frame: {}", e),
            },
            Some(WireEvent::Closed { code, reason }) => {
                self.link = None;
                self.on_closed(code, &reason);
            }
            None => {
                self.link = None;
                self.on_closed(CloseCode::ABNORMAL, "transport ended");
            }
        }
    }

    fn on_closed(&mut self, code: CloseCode, reason: &str) {
        self.heartbeat = None;
        self.link = None;
        self.router.closed(code);

        match self.config.policy.decide(code, self.attempt) {
            CloseDecision::Reconnect { attempt, delay } => {
                info!(
                    code = %code,
                    reason,
                    attempt,
                    max_attempts = self.config.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "connection closed, scheduling reconnect"
                );
                self.attempt = attempt;
                self.backoff = Some(delay);
                self.reconnect_at = Some(Instant::now() + delay);
            }
            CloseDecision::Stop(failure) => {
                if failure == ConnectionFailure::ClosedNormally {
                    info!(code = %code, "connection closed");
                } else {
                    warn!(code = %code, reason, failure = failure.as_str(), "connection closed");
                }
                self.backoff = None;
                self.error = Some(failure);
            }
        }
        self.state = ConnectionState::Closed;
        self.publish();
    }

    fn disconnect(&mut self) {
        self.manually_closed = true;
        let had_link = self.link.is_some();
        self.drop_connection(CloseCode::NORMAL, "Manual disconnect");
        self.attempt = 0;
        self.backoff = None;
        self.error = None;
        self.state = ConnectionState::Closed;
        self.publish();
        if had_link {
            self.router.closed(CloseCode::NORMAL);
        }
    }

    /// Close the link (if any) and cancel every pending timer and attempt.
    fn drop_connection(&mut self, code: CloseCode, reason: &str) {
        self.pending = None;
        self.reconnect_at = None;
        self.heartbeat = None;
        if let Some(link) = self.link.take() {
            self.state = ConnectionState::Closing;
            link.close(code, reason);
        }
    }

    fn send_frame(&mut self, frame: &OutboundFrame) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        let Some(link) = &self.link else {
            return false;
        };
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("failed to encode frame: {}", e);
                return false;
            }
        };
        match link.try_send_text(json) {
            Ok(()) => true,
            Err(e) => {
                debug!("send failed: {}", e);
                false
            }
        }
    }

    fn send_ping(&mut self) {
        if !self.send_frame(&OutboundFrame::ping_now()) {
            debug!("heartbeat skipped");
        }
    }

    fn teardown(&mut self) {
        self.drop_connection(CloseCode::NORMAL, "Session dropped");
        self.state = ConnectionState::Closed;
        self.publish();
    }

    fn publish(&self) {
        let next = SessionStatus {
            state: self.state,
            target: self.target.clone(),
            attempt: self.attempt,
            backoff: self.backoff,
            error: self.error,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn poll_pending(
    pending: &mut Option<PendingConnect>,
) -> Result<TransportLink, AttemptError> {
    match pending.as_mut() {
        Some(fut) => {
            let result = fut.await;
            *pending = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn recv_inbound(link: &mut Option<TransportLink>) -> Option<WireEvent> {
    match link.as_mut() {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub(crate) async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::transport::WireCommand;
    use crate::transport::memory::MemoryConnector;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn target() -> ChannelTarget {
        ChannelTarget::Conversation(ConversationId::from(42))
    }

    fn spawn(connector: MemoryConnector, handlers: Handlers) -> Session {
        Session::spawn(
            SessionConfig::conversation(RealtimeEndpoint::new("chat.test", false)),
            Arc::new(connector),
            Arc::new(StaticCredentials::new("tok")),
            handlers,
        )
    }

    async fn wait_for(session: &Session, state: ConnectionState) {
        let mut rx = session.subscribe();
        rx.wait_for(|s| s.state == state).await.unwrap();
    }

    #[test]
    fn indicator_reflects_state() {
        let mut status = SessionStatus::default();
        assert_eq!(status.indicator(), ConnectionIndicator::Offline);
        status.state = ConnectionState::Open;
        assert_eq!(status.indicator(), ConnectionIndicator::Connected);
        status.state = ConnectionState::Closed;
        status.backoff = Some(Duration::from_secs(1));
        assert_eq!(status.indicator(), ConnectionIndicator::Connecting);
        status.backoff = None;
        status.error = Some(ConnectionFailure::AuthenticationFailed);
        assert_eq!(status.indicator(), ConnectionIndicator::Error);
        assert_eq!(status.indicator().color(), "red");
        assert!(matches!(status.failure(), Some(SessionError::Auth)));
    }

    #[test]
    fn only_terminal_failures_become_errors() {
        let mut status = SessionStatus {
            attempt: 5,
            error: Some(ConnectionFailure::MaxReconnectAttemptsReached),
            ..Default::default()
        };
        assert!(matches!(
            status.failure(),
            Some(SessionError::ExhaustedRetries { attempts: 5 })
        ));
        status.error = Some(ConnectionFailure::NetworkOffline);
        assert!(status.failure().is_none());
        status.error = None;
        assert!(status.failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_token_in_url() {
        let (connector, mut peers) = MemoryConnector::new();
        let session = spawn(connector, Handlers::new());
        session.connect(target());

        let peer = peers.recv().await.unwrap();
        assert_eq!(peer.url, "ws://chat.test/ws/conversations/42/?token=tok");
        wait_for(&session, ConnectionState::Open).await;
        assert_eq!(session.status().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_fails_when_not_open() {
        let (connector, _peers) = MemoryConnector::new();
        let session = spawn(connector, Handlers::new());
        assert!(!session.send_message("hi").await);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_open() {
        let (connector, mut peers) = MemoryConnector::new();
        let session = spawn(connector, Handlers::new());
        session.connect(target());
        let mut peer = peers.recv().await.unwrap();
        wait_for(&session, ConnectionState::Open).await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        let ping = peer.recv_json().await.unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(ping["timestamp"].is_i64());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_keeps_session_open() {
        let (connector, mut peers) = MemoryConnector::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handlers = Handlers::new()
            .on_message(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_pong({
                let c = calls.clone();
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            });
        let session = spawn(connector, handlers);
        session.connect(target());
        let peer = peers.recv().await.unwrap();
        wait_for(&session, ConnectionState::Open).await;

        assert!(peer.send_text("{not json").await);
        assert!(peer.send_text(r#"{"type":"message"}"#).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(session.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_with_normal_code() {
        let (connector, mut peers) = MemoryConnector::new();
        let session = spawn(connector, Handlers::new());
        session.connect(target());
        let mut peer = peers.recv().await.unwrap();
        wait_for(&session, ConnectionState::Open).await;

        session.disconnect();
        assert_eq!(
            peer.recv().await,
            Some(WireCommand::Close {
                code: CloseCode::NORMAL,
                reason: "Manual disconnect".into()
            })
        );
        wait_for(&session, ConnectionState::Closed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_session_closes_transport() {
        let (connector, mut peers) = MemoryConnector::new();
        let session = spawn(connector, Handlers::new());
        session.connect(target());
        let mut peer = peers.recv().await.unwrap();
        wait_for(&session, ConnectionState::Open).await;

        drop(session);
        match peer.recv().await {
            Some(WireCommand::Close { code, .. }) => assert_eq!(code, CloseCode::NORMAL),
            other => panic!("expected close, got {other:?}"),
        }
    }
}
