//! Transport seam between a session and the wire.
//!
//! A [`Connector`] turns a URL into a [`TransportLink`]: a pair of channels
//! carrying text frames and close notifications. The session never touches a
//! socket directly, which lets tests swap in [`memory::MemoryConnector`].

pub mod memory;
mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::policy::CloseCode;

pub use websocket::WsConnector;

/// Frames buffered per direction before senders wait.
pub const LINK_BUFFER: usize = 100;

/// Something that arrived from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Text(String),
    Closed { code: CloseCode, reason: String },
}

/// Something to push to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    Text(String),
    Close { code: CloseCode, reason: String },
}

/// An open connection. Dropping `outbound` closes the connection with 1000.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<WireCommand>,
    pub inbound: mpsc::Receiver<WireEvent>,
}

impl TransportLink {
    /// Queue a text frame without waiting. Fails when the buffer is full or
    /// the connection is gone.
    pub fn try_send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .try_send(WireCommand::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Ask the peer to close. Best effort.
    pub fn close(&self, code: CloseCode, reason: &str) {
        let _ = self.outbound.try_send(WireCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError>;
}
