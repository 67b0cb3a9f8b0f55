use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tracing::{debug, warn};

use super::{Connector, LINK_BUFFER, TransportLink, WireCommand, WireEvent};
use crate::error::TransportError;
use crate::policy::CloseCode;

/// Connects with tokio-tungstenite and pumps frames on a background task.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(TransportError::from_tungstenite)?;

        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        tokio::spawn(pump(ws_stream, out_rx, in_tx));

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<WireCommand>,
    inbound: mpsc::Sender<WireEvent>,
) {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = outbound.recv() => {
                match cmd {
                    Some(WireCommand::Text(text)) => {
                        if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                            warn!("websocket send failed: {}", e);
                            let _ = inbound
                                .send(WireEvent::Closed {
                                    code: CloseCode::ABNORMAL,
                                    reason: e.to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                    Some(WireCommand::Close { code, reason }) => {
                        send_close(&mut ws_write, code, &reason).await;
                        return;
                    }
                    None => {
                        // Session dropped the link.
                        send_close(&mut ws_write, CloseCode::NORMAL, "").await;
                        return;
                    }
                }
            }
            msg = ws_read.next() => {
                let event = match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        WireEvent::Text(text.as_str().to_string())
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (CloseCode(u16::from(f.code)), f.reason.as_str().to_string()),
                            None => (CloseCode::NO_STATUS, String::new()),
                        };
                        debug!(code = %code, reason = %reason, "server closed websocket");
                        let _ = inbound.send(WireEvent::Closed { code, reason }).await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("websocket read error: {}", e);
                        let _ = inbound
                            .send(WireEvent::Closed {
                                code: CloseCode::ABNORMAL,
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                    None => {
                        let _ = inbound
                            .send(WireEvent::Closed {
                                code: CloseCode::ABNORMAL,
                                reason: String::new(),
                            })
                            .await;
                        return;
                    }
                };
                if inbound.send(event).await.is_err() {
                    send_close(&mut ws_write, CloseCode::NORMAL, "").await;
                    return;
                }
            }
        }
    }
}

async fn send_close<S>(ws_write: &mut S, code: CloseCode, reason: &str)
where
    S: SinkExt<tungstenite::Message> + Unpin,
{
    let frame = CloseFrame {
        code: WsCloseCode::from(code.0),
        reason: reason.to_string().into(),
    };
    let _ = ws_write.send(tungstenite::Message::Close(Some(frame))).await;
    let _ = ws_write.close().await;
}
