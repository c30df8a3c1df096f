//! Reconnection policy layered over the transport.
//!
//! [`ConnectionLink`] owns a supervisor task that dials through a
//! [`Connector`], forwards inbound frames, and on unexpected closure
//! schedules reconnect attempts with capped-exponential backoff until the
//! link is connected again or explicitly terminated. The original client
//! this replaces scheduled a single 3-second timer that never actually
//! redialed; here the retry loop is real.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};

use sohbet_proto::frame::{ClientFrame, ServerFrame};

use crate::transport::{Connector, Credential, Transport, TransportError, TransportEvent};

/// Observable state of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not yet started.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// The channel is live.
    Connected,
    /// The channel was lost; a retry is scheduled.
    BackingOff,
    /// Terminal: explicit teardown or retry budget exhausted.
    Terminated,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::BackingOff => write!(f, "backing off"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Backoff configuration for the reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the doubled delay.
    pub max_delay: Duration,
    /// Optional cap on consecutive failed attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): doubles from
    /// `initial_delay`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

/// The live transport slot shared between the supervisor and `send`.
type Slot<T> = Arc<RwLock<Option<Arc<T>>>>;

/// A supervised connection: one per authenticated session, shared across
/// all conversations.
///
/// Inbound frames from every connection incarnation are merged into a
/// single stream ([`take_frames`](Self::take_frames)); state transitions
/// are published through a watch channel. Only the session manager calls
/// [`send`](Self::send) and [`terminate`](Self::terminate).
pub struct ConnectionLink<C: Connector> {
    slot: Slot<C::Transport>,
    state_rx: watch::Receiver<LinkState>,
    frames: parking_lot::Mutex<Option<mpsc::Receiver<ServerFrame>>>,
    terminate_tx: watch::Sender<bool>,
    _task: tokio::task::JoinHandle<()>,
}

impl<C: Connector> ConnectionLink<C> {
    /// Spawn the supervisor and start connecting immediately.
    #[must_use]
    pub fn spawn(
        connector: C,
        credential: Credential,
        config: ReconnectConfig,
        frame_buffer: usize,
    ) -> Self {
        let slot: Slot<C::Transport> = Arc::new(RwLock::new(None));
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);
        let (frame_tx, frame_rx) = mpsc::channel(frame_buffer);
        let (terminate_tx, terminate_rx) = watch::channel(false);

        let task = tokio::spawn(supervise(
            connector,
            credential,
            config,
            Arc::clone(&slot),
            state_tx,
            frame_tx,
            terminate_rx,
        ));

        Self {
            slot,
            state_rx,
            frames: parking_lot::Mutex::new(Some(frame_rx)),
            terminate_tx,
            _task: task,
        }
    }

    /// Send a frame over the live transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] without transmitting
    /// anything when no live transport exists — the caller decides what to
    /// do with the optimistic message (typically mark it failed).
    pub async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let transport = { self.slot.read().await.as_ref().map(Arc::clone) };
        match transport {
            Some(t) if t.is_connected() => t.send(frame).await,
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// A watch receiver for observing state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Take the merged inbound frame stream. Yields `Some` exactly once.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<ServerFrame>> {
        self.frames.lock().take()
    }

    /// Request teardown: the supervisor closes the transport, suppresses
    /// further reconnect attempts, and parks in [`LinkState::Terminated`].
    /// Idempotent.
    pub fn terminate(&self) {
        let _ = self.terminate_tx.send(true);
    }
}

/// The supervisor loop: connect, pump events, back off, repeat.
async fn supervise<C: Connector>(
    connector: C,
    credential: Credential,
    config: ReconnectConfig,
    slot: Slot<C::Transport>,
    state_tx: watch::Sender<LinkState>,
    frame_tx: mpsc::Sender<ServerFrame>,
    mut terminate_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    'outer: loop {
        if *terminate_rx.borrow() {
            break;
        }

        let _ = state_tx.send(LinkState::Connecting);
        let connected = tokio::select! {
            result = connector.connect(&credential) => result,
            _ = terminate_rx.changed() => break 'outer,
        };

        match connected {
            Ok(transport) => {
                let transport = Arc::new(transport);
                let Some(mut events) = transport.take_events() else {
                    tracing::error!("transport produced no event stream, giving up");
                    break 'outer;
                };

                *slot.write().await = Some(Arc::clone(&transport));
                attempt = 0;
                let _ = state_tx.send(LinkState::Connected);
                tracing::info!("chat link connected");

                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(TransportEvent::Frame(frame)) => {
                                if frame_tx.send(frame).await.is_err() {
                                    // Frame consumer gone; nothing left to supervise.
                                    transport.close().await;
                                    break 'outer;
                                }
                            }
                            Some(TransportEvent::Closed { reason }) => {
                                tracing::warn!(reason = %reason, "chat link lost");
                                break;
                            }
                            None => {
                                tracing::warn!("chat link event stream ended");
                                break;
                            }
                        },
                        _ = terminate_rx.changed() => {
                            transport.close().await;
                            break 'outer;
                        }
                    }
                }

                *slot.write().await = None;
            }
            Err(e) => {
                tracing::warn!(err = %e, attempt, "chat connect attempt failed");
            }
        }

        attempt += 1;
        if let Some(max) = config.max_attempts
            && attempt > max
        {
            tracing::warn!(attempts = attempt - 1, "reconnect attempts exhausted");
            break 'outer;
        }

        let delay = config.delay_for(attempt);
        let _ = state_tx.send(LinkState::BackingOff);
        tracing::debug!(?delay, "scheduling reconnect");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = terminate_rx.changed() => break 'outer,
        }
    }

    *slot.write().await = None;
    let _ = state_tx.send(LinkState::Terminated);
    tracing::info!("chat link supervisor exiting");
}
