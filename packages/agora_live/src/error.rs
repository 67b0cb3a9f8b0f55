use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Failures of the live transport itself.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("realtime server is unavailable")]
    Unavailable,

    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] Box<tungstenite::Error>),

    #[error("invalid realtime url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("transport is not connected")]
    NotConnected,
}

impl TransportError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Handshake(Box::new(err))
        }
    }
}

/// A frame that could not be decoded. Logged and dropped by the session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failures of the REST fallback client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api server is unavailable")]
    Unavailable,

    #[error("no credentials available")]
    MissingCredentials,

    #[error("api returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("could not decode api response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Http(err)
        }
    }

    /// 401/403 from the backend.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. } | Self::MissingCredentials)
    }
}

/// Errors returned by channel controllers to their callers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed")]
    Auth,

    #[error("gave up after {attempts} reconnection attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("message {temp_id} was not confirmed within {timeout:?}")]
    SendTimeout { temp_id: u64, timeout: Duration },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("message has neither text nor image")]
    EmptyMessage,

    #[error("no failed message with id {temp_id}")]
    NotFailed { temp_id: u64 },

    #[error("channel is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_maps_to_unavailable() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = TransportError::from_tungstenite(tungstenite::Error::Io(io));
        assert!(matches!(err, TransportError::Unavailable));
    }

    #[test]
    fn other_tungstenite_errors_are_handshake_failures() {
        let err = TransportError::from_tungstenite(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, TransportError::Handshake(_)));
    }

    #[test]
    fn auth_statuses_are_detected() {
        let err = ApiError::Status {
            status: 401,
            body: String::new(),
        };
        assert!(err.is_auth());
        let err = ApiError::Status {
            status: 500,
            body: String::new(),
        };
        assert!(!err.is_auth());
    }

    #[test]
    fn malformed_json_is_reported_as_malformed_frame() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ProtocolError::from(parse);
        assert!(err.to_string().starts_with("malformed frame"));
    }
}
