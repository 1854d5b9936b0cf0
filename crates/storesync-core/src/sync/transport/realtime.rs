//! Real-time channel to the coordinating service.
//!
//! A [`RealtimeLink`] opens one session at a time. The session is a pair of
//! channels: [`ClientEvent`]s go out, [`ServerEvent`]s come in. When the
//! inbound side closes the session is over and the transport decides whether
//! to reconnect.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::{ClientEvent, ServerEvent};
use crate::types::DeviceId;

/// An open session with the coordinating service.
pub struct RealtimeSession {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Opens sessions with a coordinating service.
#[async_trait]
pub trait RealtimeLink: Send + Sync + 'static {
    /// Open a new session for `device_id`.
    ///
    /// Registration is the caller's job: the first outbound event should be
    /// [`ClientEvent::RegisterDevice`].
    async fn open(&self, device_id: &DeviceId) -> SyncResult<RealtimeSession>;
}

/// Default bound on the TCP connect plus WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// WebSocket link carrying JSON-encoded events as text frames.
pub struct WebSocketLink {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Give up on a connect attempt that has not completed the handshake
    /// within `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RealtimeLink for WebSocketLink {
    async fn open(&self, device_id: &DeviceId) -> SyncResult<RealtimeSession> {
        let connecting = tokio_tungstenite::connect_async(self.url.as_str());
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| {
                SyncError::Connection(format!(
                    "{}: handshake timed out after {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| SyncError::Connection(format!("{}: {}", self.url, e)))?;
        debug!(url = %self.url, device = %device_id, "WebSocket connected");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outbound event");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            trace!("WebSocket writer finished");
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "Ignoring unrecognised server event"),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "WebSocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
            trace!("WebSocket reader finished");
        });

        Ok(RealtimeSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
