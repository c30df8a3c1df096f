//! WebSocket transport to the chat backend.
//!
//! Implements the [`Transport`] trait over a WebSocket connection. The
//! credential is embedded in the connection URI path (the backend cannot
//! read headers during the WebSocket upgrade), and frames are JSON text,
//! one frame per WebSocket message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use sohbet_proto::codec;
use sohbet_proto::frame::ClientFrame;

use super::{Connector, Credential, Transport, TransportError, TransportEvent};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for the WebSocket connect handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound event channel.
const EVENT_BUFFER: usize = 256;

/// WebSocket transport implementing the [`Transport`] trait.
///
/// Created via [`WsTransport::connect`], which establishes the connection
/// and spawns a background reader task that decodes inbound text frames
/// into [`TransportEvent`]s.
pub struct WsTransport {
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    /// Event stream handed to the reconnection policy, taken once.
    events: parking_lot::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    /// Whether the channel is currently connected.
    connected: Arc<AtomicBool>,
    /// Set by an explicit local `close()` to suppress the Closed event.
    closed_locally: Arc<AtomicBool>,
    /// Handle to the background reader task.
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connect to the chat backend's WebSocket endpoint.
    ///
    /// The channel URI is `{ws_base}/ws/chat/{token}` — the credential rides
    /// in the path, not in a separate frame.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Handshake`] if the connect times out or the
    ///   upgrade is rejected.
    /// - [`TransportError::Io`] for network-level failures.
    pub async fn connect(ws_base: &str, credential: &Credential) -> Result<Self, TransportError> {
        let url = format!(
            "{}/ws/chat/{}",
            ws_base.trim_end_matches('/'),
            credential.token()
        );

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| {
                tracing::warn!(base = ws_base, "chat WebSocket connect timed out");
                TransportError::Handshake("connect timed out".into())
            })?
            .map_err(|e| {
                tracing::warn!(base = ws_base, err = %e, "chat WebSocket connect failed");
                map_ws_connect_error(e)
            })?;

        tracing::info!(base = ws_base, "chat channel established");

        let (ws_sender, ws_reader) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let closed_locally = Arc::new(AtomicBool::new(false));

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            event_tx,
            Arc::clone(&connected),
            Arc::clone(&closed_locally),
        ));

        Ok(Self {
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            events: parking_lot::Mutex::new(Some(event_rx)),
            connected,
            closed_locally,
            _reader_handle: reader_handle,
        })
    }
}

impl Transport for WsTransport {
    async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }

        let text = codec::encode_client(frame)?;

        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "chat channel send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::LinkLost(e.to_string())
        })?;

        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        // Idempotent: only the first close sends the Close frame.
        if self.closed_locally.swap(true, Ordering::Relaxed) {
            return;
        }
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "close frame not delivered (channel already down)");
        }
    }
}

/// Background task that reads WebSocket messages and emits typed events.
///
/// Text frames are decoded as [`ServerFrame`](sohbet_proto::frame::ServerFrame)s;
/// malformed or unknown-type frames are logged and skipped — the connection
/// survives bad data. When the stream ends (server close, network drop) a
/// single [`TransportEvent::Closed`] is emitted, unless the closure was
/// requested locally.
async fn reader_loop(
    mut ws_reader: WsReader,
    event_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    closed_locally: Arc<AtomicBool>,
) {
    let mut close_reason = String::from("stream ended");

    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode_server(&text) {
                Ok(frame) => {
                    if event_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                        // Receiver dropped — transport was dropped, exit.
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed inbound frame, skipping");
                }
            },
            Ok(Message::Close(close_frame)) => {
                tracing::info!(?close_frame, "chat channel closed by server");
                close_reason = "closed by server".into();
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {
                // The protocol is text-only; control and binary frames are ignored.
            }
            Err(e) => {
                tracing::warn!(err = %e, "chat channel read error");
                close_reason = e.to_string();
                break;
            }
        }
    }

    connected.store(false, Ordering::Relaxed);

    if closed_locally.load(Ordering::Relaxed) {
        tracing::debug!("chat channel reader exiting after local close");
        return;
    }

    let _ = event_tx
        .send(TransportEvent::Closed {
            reason: close_reason,
        })
        .await;
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => TransportError::Io(io_err),
        WsError::Http(response) => {
            // The backend rejects bad credentials during the upgrade.
            TransportError::Handshake(format!("upgrade rejected: status {}", response.status()))
        }
        other => TransportError::Handshake(other.to_string()),
    }
}

/// Connector producing [`WsTransport`]s for the reconnection policy.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// WebSocket base URL of the chat backend (e.g. `ws://host:8000`).
    ws_base: String,
}

impl WsConnector {
    /// Creates a connector dialing the given WebSocket base URL.
    pub fn new(ws_base: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into(),
        }
    }

    /// Returns the WebSocket base URL this connector dials.
    #[must_use]
    pub fn ws_base(&self) -> &str {
        &self.ws_base
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, credential: &Credential) -> Result<WsTransport, TransportError> {
        WsTransport::connect(&self.ws_base, credential).await
    }
}
