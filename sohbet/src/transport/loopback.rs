//! Loopback transport for testing.
//!
//! Simulates the chat backend's side of the channel in-process using
//! [`tokio::sync::mpsc`] channels. Created via
//! [`LoopbackTransport::create_pair`], which returns the client-side
//! transport and a [`LoopbackPeer`] handle the test drives as the server:
//! injecting inbound frames, observing sent frames, and severing the link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use sohbet_proto::frame::{ClientFrame, ServerFrame};

use super::{Transport, TransportError, TransportEvent};

/// In-process transport backed by `tokio::sync::mpsc` channels.
pub struct LoopbackTransport {
    /// Outbound frames, delivered to the peer handle.
    sent_tx: mpsc::Sender<ClientFrame>,
    /// Inbound event stream, taken once by the reconnection policy.
    events: parking_lot::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    /// Shared connection flag; the peer clears it when severing.
    connected: Arc<AtomicBool>,
    /// Set by an explicit local close.
    closed_locally: Arc<AtomicBool>,
}

/// Test-side handle standing in for the server end of the channel.
pub struct LoopbackPeer {
    /// Injects events into the transport's stream.
    event_tx: mpsc::Sender<TransportEvent>,
    /// Receives frames the client sent.
    sent_rx: Mutex<mpsc::Receiver<ClientFrame>>,
    /// Shared connection flag.
    connected: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Create a connected transport/peer pair with the given channel capacity.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, LoopbackPeer) {
        let (sent_tx, sent_rx) = mpsc::channel(buffer);
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let connected = Arc::new(AtomicBool::new(true));

        let transport = Self {
            sent_tx,
            events: parking_lot::Mutex::new(Some(event_rx)),
            connected: Arc::clone(&connected),
            closed_locally: Arc::new(AtomicBool::new(false)),
        };
        let peer = LoopbackPeer {
            event_tx,
            sent_rx: Mutex::new(sent_rx),
            connected,
        };
        (transport, peer)
    }
}

impl Transport for LoopbackTransport {
    async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        self.sent_tx
            .send(frame.clone())
            .await
            .map_err(|_| TransportError::LinkLost("peer dropped".into()))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.closed_locally.store(true, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl LoopbackPeer {
    /// Deliver an inbound frame to the client, as the server would.
    ///
    /// # Panics
    ///
    /// Panics if the transport's event stream has been dropped — in tests
    /// that means the link under test went away unexpectedly.
    pub async fn deliver(&self, frame: ServerFrame) {
        self.event_tx
            .send(TransportEvent::Frame(frame))
            .await
            .unwrap_or_else(|_| panic!("loopback transport dropped its event stream"));
    }

    /// Receive the next frame the client sent, if any.
    pub async fn next_sent(&self) -> Option<ClientFrame> {
        let mut rx = self.sent_rx.lock().await;
        rx.recv().await
    }

    /// Non-blocking check for a sent frame.
    pub async fn try_next_sent(&self) -> Option<ClientFrame> {
        let mut rx = self.sent_rx.lock().await;
        rx.try_recv().ok()
    }

    /// Sever the link unexpectedly, as a network drop would.
    ///
    /// Marks the transport disconnected and emits the one
    /// [`TransportEvent::Closed`] notification.
    pub async fn sever(&self, reason: &str) {
        self.connected.store(false, Ordering::Relaxed);
        let _ = self
            .event_tx
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }
}
