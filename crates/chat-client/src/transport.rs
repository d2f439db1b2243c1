//! Transport seam.
//!
//! The supervisor consumes a transport as a single event stream plus a
//! frame sender, instead of wiring mutable callbacks onto a socket. The
//! real implementation wraps `tokio-tungstenite`; tests inject scripted
//! connectors.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use chat_protocol::ClientFrame;

use crate::error::{ClientError, Result};

/// What a live transport reports back to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One raw text payload (possibly several newline-delimited records).
    Frame(String),
    /// The peer closed the connection.
    Closed { code: Option<u16>, reason: String },
    /// The transport failed without a close handshake.
    Failed(String),
}

/// Commands accepted by a transport's write half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    Frame(ClientFrame),
    /// Graceful close with a normal status code.
    Close,
}

/// Cheap handle to a transport's write half.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<OutboundCommand>,
}

impl FrameSender {
    /// Create a sender plus the command receiver a transport drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame. Returns false if the transport has gone away.
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.tx.send(OutboundCommand::Frame(frame)).is_ok()
    }

    /// Ask the transport to close gracefully.
    pub fn close(&self) {
        let _ = self.tx.send(OutboundCommand::Close);
    }
}

/// A connected transport: the sender half and the inbound event stream.
pub struct TransportHandle {
    pub sender: FrameSender,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports. One connector serves the whole client lifetime; each
/// call produces one connection generation.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> impl Future<Output = Result<TransportHandle>> + Send;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: Url) -> Result<TransportHandle> {
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::WebSocket(err.to_string()))?;
        debug!(%url, "websocket connected");

        let (mut sink, mut stream) = ws.split();
        let (sender, mut commands) = FrameSender::channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        // Write half: drain commands until close or sink failure.
        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    OutboundCommand::Frame(frame) => {
                        if let Err(err) = sink.send(Message::Text(frame.encode().into())).await {
                            warn!(%err, "websocket send failed");
                            let _ = writer_events.send(TransportEvent::Failed(err.to_string()));
                            return;
                        }
                    }
                    OutboundCommand::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        });

        // Read half: map socket messages to events until the stream ends.
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        if event_tx
                            .send(TransportEvent::Frame(text.to_string()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_default();
                        debug!(?code, reason, "websocket closed by peer");
                        let _ = event_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = event_tx.send(TransportEvent::Failed(err.to_string()));
                        return;
                    }
                }
            }
            // Stream ended without a close frame.
            let _ = event_tx.send(TransportEvent::Closed {
                code: None,
                reason: String::new(),
            });
        });

        Ok(TransportHandle { sender, events })
    }
}
