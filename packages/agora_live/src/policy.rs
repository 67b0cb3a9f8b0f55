//! Close codes, connection states and the reconnect policy.
//!
//! The policy is pure: the session asks it what to do after every close and
//! only owns the timers.

use std::fmt;
use std::time::Duration;

/// WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Reported when no close frame was received, including failed handshakes.
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// The backend closes with this code when the token is rejected.
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session stopped trying (or could not start).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    AuthenticationFailed,
    ConnectionLostUnexpectedly,
    MaxReconnectAttemptsReached,
    ClosedNormally,
    MissingCredentials,
    NetworkOffline,
}

impl ConnectionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::ConnectionLostUnexpectedly => "connection_lost_unexpectedly",
            Self::MaxReconnectAttemptsReached => "max_reconnect_attempts_reached",
            Self::ClosedNormally => "closed_normally",
            Self::MissingCredentials => "missing_credentials",
            Self::NetworkOffline => "network_offline",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "Authentication failed",
            Self::ConnectionLostUnexpectedly => "Connection lost unexpectedly",
            Self::MaxReconnectAttemptsReached => "Max reconnection attempts reached",
            Self::ClosedNormally => "Connection closed normally",
            Self::MissingCredentials => "Missing credentials",
            Self::NetworkOffline => "Network disconnected",
        }
    }
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// What the session should do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    Reconnect { attempt: u32, delay: Duration },
    Stop(ConnectionFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Treat 1006 as terminal instead of retrying it.
    pub abnormal_close_is_terminal: bool,
}

impl ReconnectPolicy {
    /// Conversation channels: 1s doubling up to 10s, 1006 does not retry.
    pub fn conversation() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            abnormal_close_is_terminal: true,
        }
    }

    /// Notification channel: same backoff, but 1006 is retried.
    pub fn notifications() -> Self {
        Self {
            abnormal_close_is_terminal: false,
            ..Self::conversation()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    pub fn is_terminal(&self, code: CloseCode) -> bool {
        code == CloseCode::NORMAL
            || code == CloseCode::POLICY_VIOLATION
            || (self.abnormal_close_is_terminal && code == CloseCode::ABNORMAL)
    }

    /// Decide after a close with `code`, given the attempts already made
    /// since the last successful open.
    pub fn decide(&self, code: CloseCode, attempts: u32) -> CloseDecision {
        if !self.is_terminal(code) && attempts < self.max_attempts {
            let attempt = attempts + 1;
            return CloseDecision::Reconnect {
                attempt,
                delay: self.delay_for(attempt),
            };
        }

        let failure = if code == CloseCode::POLICY_VIOLATION {
            ConnectionFailure::AuthenticationFailed
        } else if code == CloseCode::ABNORMAL && self.abnormal_close_is_terminal {
            ConnectionFailure::ConnectionLostUnexpectedly
        } else if attempts >= self.max_attempts {
            ConnectionFailure::MaxReconnectAttemptsReached
        } else {
            ConnectionFailure::ClosedNormally
        };
        CloseDecision::Stop(failure)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::conversation()
    }
}
