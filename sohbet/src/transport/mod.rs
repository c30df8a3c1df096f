//! Transport layer for the persistent chat connection.
//!
//! Defines the [`Transport`] trait satisfied by all channel implementations
//! and the [`Connector`] trait the reconnection policy dials through.
//! Concrete implementations:
//! - [`ws::WsTransport`] — WebSocket connection to the chat backend
//! - [`loopback::LoopbackTransport`] — in-process transport for testing

pub mod loopback;
pub mod ws;

use std::fmt;

use tokio::sync::mpsc;

use sohbet_proto::codec::CodecError;
use sohbet_proto::frame::{ClientFrame, ServerFrame};

/// Opaque bearer credential identifying the authenticated user.
///
/// Passed explicitly into [`Connector::connect`] and the REST collaborators;
/// core logic never reads credentials from ambient global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Creates a credential from its token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token, for embedding into a channel URI or an
    /// `Authorization` header.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Credential {
    /// Redacted — credentials must never leak into logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<credential>")
    }
}

/// Events emitted by a transport for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound frame arrived, in network arrival order.
    Frame(ServerFrame),
    /// The channel left the connected state unexpectedly (server close,
    /// network drop). Emitted at most once per connection, and never for
    /// an explicit local [`Transport::close`].
    Closed {
        /// Human-readable reason for diagnostics.
        reason: String,
    },
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A send was attempted while the channel is not connected. The send
    /// fails synchronously and mutates nothing.
    #[error("not connected")]
    NotConnected,

    /// The channel dropped out from under an in-flight operation.
    #[error("link lost: {0}")]
    LinkLost(String),

    /// The connection handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An outbound frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live bidirectional channel to the chat backend.
///
/// A transport represents a single connection lifetime: once it reports
/// [`TransportEvent::Closed`] it is dead and the reconnection policy dials
/// a replacement through the [`Connector`].
pub trait Transport: Send + Sync + 'static {
    /// Send one frame as a discrete unit — no batching, no implicit retry.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] immediately when the channel
    /// is not connected, or [`TransportError::LinkLost`] when the wire drops
    /// mid-send.
    fn send(
        &self,
        frame: &ClientFrame,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Take the inbound event stream. Yields `Some` exactly once; the
    /// reconnection policy consumes it for the connection's lifetime.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Whether the channel is currently connected.
    fn is_connected(&self) -> bool;

    /// Explicit, intentional teardown. Idempotent. Suppresses the
    /// [`TransportEvent::Closed`] notification.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Factory for establishing transports, one call per connection attempt.
///
/// The reconnection policy owns a connector and dials through it after
/// every unexpected closure; tests inject flaky connectors to exercise
/// the retry loop.
pub trait Connector: Send + Sync + 'static {
    /// The transport type this connector produces.
    type Transport: Transport;

    /// Establish a new channel using the given credential.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] or [`TransportError::Io`] when
    /// the channel cannot be established.
    fn connect(
        &self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<Self::Transport, TransportError>> + Send;
}
