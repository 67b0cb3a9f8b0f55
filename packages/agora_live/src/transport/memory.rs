//! In-process connector for driving sessions without a network.
//!
//! Each successful connect hands a [`MemoryPeer`] to whoever holds the
//! receiver returned by [`MemoryConnector::new`]; the peer plays the server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connector, LINK_BUFFER, TransportLink, WireCommand, WireEvent};
use crate::error::TransportError;
use crate::policy::CloseCode;

#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    attempts: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<String>>>,
    refuse: Arc<AtomicBool>,
    latency: Option<Duration>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers: tx,
            attempts: Arc::new(AtomicUsize::new(0)),
            urls: Arc::new(Mutex::new(Vec::new())),
            refuse: Arc::new(AtomicBool::new(false)),
            latency: None,
        };
        (connector, rx)
    }

    /// Delay every connect by `latency` before it resolves.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make subsequent connects fail as if the server were down.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect calls so far, including refused ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }

        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        let peer = MemoryPeer {
            url: url.to_string(),
            to_client: in_tx,
            from_client: out_rx,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Unavailable)?;

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Server end of an in-memory link.
pub struct MemoryPeer {
    pub url: String,
    to_client: mpsc::Sender<WireEvent>,
    from_client: mpsc::Receiver<WireCommand>,
}

impl MemoryPeer {
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(WireEvent::Text(text.into()))
            .await
            .is_ok()
    }

    pub async fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string()).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> bool {
        self.to_client
            .send(WireEvent::Closed {
                code: CloseCode(code),
                reason: reason.to_string(),
            })
            .await
            .is_ok()
    }

    /// Next frame from the client; `None` once the client dropped the link.
    pub async fn recv(&mut self) -> Option<WireCommand> {
        self.from_client.recv().await
    }

    /// Next text frame decoded as JSON, skipping close commands.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.recv().await? {
                WireCommand::Text(text) => return serde_json::from_str(&text).ok(),
                WireCommand::Close { .. } => continue,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<WireCommand> {
        self.from_client.try_recv().ok()
    }

    /// Stop accepting client frames while still delivering server frames,
    /// so the client's sends fail on a link that looks open.
    pub fn stop_reading(&mut self) {
        self.from_client.close();
    }
}
