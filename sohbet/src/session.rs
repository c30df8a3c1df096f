//! Session orchestration: one authenticated user, one supervised link,
//! many conversations.
//!
//! The [`SessionManager`] owns the [`ConnectionLink`], routes inbound
//! frames to the right [`ConversationStore`], runs the history load on
//! peer selection (with a stale-response guard for rapid re-selection),
//! validates and sends outbound messages, and tears everything down on
//! request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};

use sohbet_proto::frame::{ClientFrame, ServerFrame};
use sohbet_proto::message::{ContentError, LocalId, MessageRecord, UserId, validate_content};

use crate::conversation::{ApplyOutcome, ConversationStore, Message};
use crate::history::{HistoryError, HistoryLoader};
use crate::reconnect::{ConnectionLink, LinkState};
use crate::transport::Connector;

/// Notifications the session surfaces to its consumer (CLI, UI layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The conversation with this peer gained or reconciled a message.
    ConversationUpdated {
        /// The affected conversation's peer.
        peer_id: UserId,
    },
    /// The supervised link changed state.
    ConnectionChanged(LinkState),
    /// The server rejected an operation; transient notice, never stored.
    ServerNotice {
        /// Rejection reason as the server phrased it.
        message: String,
    },
    /// A history load failed; the conversation stays unseeded until the
    /// peer is selected again.
    HistoryFailed {
        /// The peer whose transcript could not be loaded.
        peer_id: UserId,
        /// Failure description for display.
        reason: String,
    },
}

/// Errors surfaced directly from [`SessionManager::send_message`].
///
/// Transport failures are not in here: a message that passed validation is
/// always inserted optimistically, and a failed wire send shows up as
/// [`DeliveryState::Failed`](crate::conversation::DeliveryState::Failed)
/// on that copy instead of an error return.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Content failed validation; nothing was inserted or transmitted.
    #[error("invalid message content: {0}")]
    InvalidContent(#[from] ContentError),

    /// The session has been shut down.
    #[error("session closed")]
    Closed,
}

/// Errors surfaced from [`SessionManager::select_peer`].
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    /// The transcript load failed; selecting the peer again retries.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// The session has been shut down.
    #[error("session closed")]
    Closed,
}

/// State shared between the manager's public surface and its router task.
struct Inner {
    self_id: UserId,
    conversations: parking_lot::Mutex<HashMap<UserId, ConversationStore>>,
    /// Bumped on every peer selection; a history response whose generation
    /// is no longer current is discarded.
    load_generation: AtomicU64,
    closed: AtomicBool,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl Inner {
    /// Emit an event without blocking the router; a consumer that falls
    /// behind loses notifications, not messages.
    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::warn!(err = %e, "session event dropped, consumer lagging");
        }
    }
}

/// Orchestrates one authenticated messaging session.
pub struct SessionManager<C: Connector, L> {
    link: Arc<ConnectionLink<C>>,
    loader: L,
    inner: Arc<Inner>,
    events: parking_lot::Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    router: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<C, L> SessionManager<C, L>
where
    C: Connector,
    L: HistoryLoader,
{
    /// Create the session around an already-spawned link and start the
    /// frame router.
    #[must_use]
    pub fn new(self_id: UserId, link: ConnectionLink<C>, loader: L, event_buffer: usize) -> Self {
        let link = Arc::new(link);
        let (event_tx, event_rx) = mpsc::channel(event_buffer);
        let inner = Arc::new(Inner {
            self_id,
            conversations: parking_lot::Mutex::new(HashMap::new()),
            load_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            event_tx,
        });

        let frames = link.take_frames();
        let state_rx = link.watch_state();
        let router = frames.map(|frames| {
            tokio::spawn(route_frames(Arc::clone(&inner), frames, state_rx))
        });
        if router.is_none() {
            tracing::error!("link frame stream already taken, session will see no inbound frames");
        }

        Self {
            link,
            loader,
            inner,
            events: parking_lot::Mutex::new(Some(event_rx)),
            router: parking_lot::Mutex::new(router),
        }
    }

    /// Take the session event stream. Yields `Some` exactly once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.lock().take()
    }

    /// Current state of the supervised link.
    #[must_use]
    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// A watch receiver for link state transitions.
    #[must_use]
    pub fn watch_link_state(&self) -> watch::Receiver<LinkState> {
        self.link.watch_state()
    }

    /// Snapshot of the conversation view with `peer`, if one exists.
    #[must_use]
    pub fn conversation_view(&self, peer: &UserId) -> Option<Vec<Message>> {
        let conversations = self.inner.conversations.lock();
        conversations.get(peer).map(|s| s.messages().to_vec())
    }

    /// Select `peer` as the active conversation and load its transcript.
    ///
    /// Exactly one load attempt is made. If the user selects another peer
    /// while this load is in flight, the late response is discarded rather
    /// than seeding a conversation the user already navigated away from.
    /// A failed load leaves the conversation unseeded; selecting the peer
    /// again retries.
    ///
    /// # Errors
    ///
    /// Returns [`SelectError::Closed`] after shutdown and the load's
    /// [`HistoryError`] otherwise. A discarded stale response is not an
    /// error.
    pub async fn select_peer(&self, peer: UserId) -> Result<(), SelectError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SelectError::Closed);
        }
        let generation = self.inner.load_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(peer = %peer, generation, "selecting peer");

        let result = self.loader.load(&peer).await;

        // Shutdown while the load was in flight must not resurrect state.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SelectError::Closed);
        }
        if self.inner.load_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(peer = %peer, generation, "discarding stale history response");
            return Ok(());
        }

        match result {
            Ok(transcript) => {
                {
                    let mut conversations = self.inner.conversations.lock();
                    let store = conversations
                        .entry(peer.clone())
                        .or_insert_with(|| self.new_store(&peer));
                    if store.is_seeded() {
                        // Re-selection reloads from scratch; the fresh
                        // transcript supersedes the old view.
                        *store = self.new_store(&peer);
                    }
                    // Freshly (re)created store, seeding cannot fail.
                    let _ = store.seed(transcript);
                }
                self.inner.emit(SessionEvent::ConversationUpdated {
                    peer_id: peer.clone(),
                });
                tracing::info!(peer = %peer, "conversation seeded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(peer = %peer, err = %e, "history load failed");
                self.inner.emit(SessionEvent::HistoryFailed {
                    peer_id: peer,
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Validate and send a message to `peer`.
    ///
    /// On success the optimistic copy is already visible as pending; the
    /// server's echo will confirm it. A wire failure marks the copy failed
    /// and still returns its [`LocalId`].
    ///
    /// # Errors
    ///
    /// Returns [`SendError::InvalidContent`] before anything is inserted
    /// or transmitted, and [`SendError::Closed`] after shutdown.
    pub async fn send_message(&self, peer: &UserId, content: &str) -> Result<LocalId, SendError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        validate_content(content)?;

        let local_id = {
            let mut conversations = self.inner.conversations.lock();
            let store = conversations
                .entry(peer.clone())
                .or_insert_with(|| self.new_store(peer));
            store.append_optimistic(content)
        };
        self.inner.emit(SessionEvent::ConversationUpdated {
            peer_id: peer.clone(),
        });

        let frame = ClientFrame::Message {
            receiver_id: peer.clone(),
            content: content.to_string(),
            local_id,
        };
        if let Err(e) = self.link.send(&frame).await {
            tracing::warn!(peer = %peer, err = %e, "send failed, marking message failed");
            let mut conversations = self.inner.conversations.lock();
            if let Some(store) = conversations.get_mut(peer) {
                store.mark_failed(local_id);
            }
            drop(conversations);
            self.inner.emit(SessionEvent::ConversationUpdated {
                peer_id: peer.clone(),
            });
        }
        Ok(local_id)
    }

    /// Tear the session down: terminate the link, stop the router, and
    /// discard all conversation state. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down session");
        self.link.terminate();
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.inner.conversations.lock().clear();
    }

    fn new_store(&self, peer: &UserId) -> ConversationStore {
        ConversationStore::new(self.inner.self_id.clone(), peer.clone())
    }
}

impl<C: Connector, L> Drop for SessionManager<C, L> {
    fn drop(&mut self) {
        self.link.terminate();
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
    }
}

/// Router task: demultiplex inbound frames into conversation stores and
/// republish link state changes as session events.
async fn route_frames(
    inner: Arc<Inner>,
    mut frames: mpsc::Receiver<ServerFrame>,
    mut state_rx: watch::Receiver<LinkState>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(ServerFrame::Message(record)) => route_record(&inner, record),
                Some(ServerFrame::Error { message }) => {
                    tracing::warn!(reason = %message, "server rejected an operation");
                    inner.emit(SessionEvent::ServerNotice { message });
                }
                None => break,
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                inner.emit(SessionEvent::ConnectionChanged(state));
            }
        }
    }
    tracing::debug!("session router exiting");
}

/// Feed one confirmed record into the conversation it belongs to.
///
/// The conversation is keyed by the other participant: the sender for
/// received messages, the receiver for echoes of our own. A store is
/// created on demand so messages from not-yet-selected peers are kept
/// (buffered until that conversation is seeded).
fn route_record(inner: &Inner, record: MessageRecord) {
    let peer_id = if record.sender_id == inner.self_id {
        record.receiver_id.clone()
    } else {
        record.sender_id.clone()
    };

    let outcome = {
        let mut conversations = inner.conversations.lock();
        let store = conversations
            .entry(peer_id.clone())
            .or_insert_with(|| ConversationStore::new(inner.self_id.clone(), peer_id.clone()));
        store.apply_incoming(record)
    };

    match outcome {
        ApplyOutcome::Inserted | ApplyOutcome::Confirmed(_) => {
            inner.emit(SessionEvent::ConversationUpdated { peer_id });
        }
        ApplyOutcome::Buffered => {
            tracing::debug!(peer = %peer_id, "frame buffered until conversation is seeded");
        }
        ApplyOutcome::Duplicate => {
            tracing::debug!(peer = %peer_id, "duplicate frame dropped");
        }
        ApplyOutcome::Ignored => {
            tracing::warn!(peer = %peer_id, "frame did not match its routed conversation");
        }
    }
}
