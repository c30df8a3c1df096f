//! Per-peer conversation state.
//!
//! A [`ConversationStore`] owns the ordered, deduplicated view of one
//! two-party conversation: the seeded transcript, live arrivals, and the
//! optimistic copies of messages this client sent. The store is plain
//! synchronous state; the session manager serializes access to it.
//!
//! Ordering is arrival order: history rows in server order, then live
//! frames as the network delivered them. A confirmed timestamp that sorts
//! earlier than its predecessors does not reorder the view.

use std::collections::HashSet;

use sohbet_proto::message::{LocalId, MessageId, MessageRecord, Timestamp, UserId};

/// Delivery status of one message in the conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sent optimistically, not yet confirmed by the server.
    Pending,
    /// Sent by us and confirmed (echoed) by the server.
    Confirmed,
    /// Received from the peer.
    Received,
    /// The send failed; the copy stays visible and marked.
    Failed,
}

/// One message as the conversation view holds it.
///
/// `id` and `timestamp` are absent while a sent message is still pending;
/// both are filled in when the server's echo reconciles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id, once confirmed.
    pub id: Option<MessageId>,
    /// Client-side correlation id; present on messages this client sent.
    pub local_id: Option<LocalId>,
    /// Who sent the message.
    pub sender_id: UserId,
    /// Who it was addressed to.
    pub receiver_id: UserId,
    /// Text body.
    pub content: String,
    /// Server-assigned timestamp, once confirmed.
    pub timestamp: Option<Timestamp>,
    /// Current delivery status.
    pub delivery: DeliveryState,
}

/// Outcome of feeding one inbound record into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record belongs to a different conversation; nothing changed.
    Ignored,
    /// The store is not yet seeded; the record was buffered and will be
    /// applied after the transcript lands.
    Buffered,
    /// A record with this server id is already present.
    Duplicate,
    /// The record reconciled an optimistic pending copy in place.
    Confirmed(LocalId),
    /// The record was appended as a new message.
    Inserted,
}

/// Error from seeding a store that already holds a transcript.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conversation already seeded")]
pub struct AlreadySeeded;

/// Ordered, deduplicated state of one two-party conversation.
pub struct ConversationStore {
    self_id: UserId,
    peer_id: UserId,
    messages: Vec<Message>,
    /// Server ids seen so far, for duplicate suppression.
    seen_ids: HashSet<MessageId>,
    /// Live frames that arrived before the transcript.
    pre_seed: Vec<MessageRecord>,
    seeded: bool,
}

impl ConversationStore {
    /// Creates an empty, unseeded store for the conversation between
    /// `self_id` and `peer_id`.
    #[must_use]
    pub fn new(self_id: UserId, peer_id: UserId) -> Self {
        Self {
            self_id,
            peer_id,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            pre_seed: Vec::new(),
            seeded: false,
        }
    }

    /// The peer this store tracks.
    #[must_use]
    pub fn peer_id(&self) -> &UserId {
        &self.peer_id
    }

    /// Whether the historical transcript has been applied.
    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// The current conversation view, in insertion order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Seed the store with the historical transcript, then drain any live
    /// frames that arrived while the load was in flight. Duplicate ids
    /// across the two sources collapse to one entry.
    ///
    /// Optimistic copies appended before seeding (the user typed into a
    /// conversation whose transcript was still loading) end up below the
    /// history, keeping the transcript in server order on top.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadySeeded`] if a transcript was applied before; the
    /// store is left untouched in that case.
    pub fn seed(&mut self, transcript: Vec<MessageRecord>) -> Result<(), AlreadySeeded> {
        if self.seeded {
            return Err(AlreadySeeded);
        }
        self.seeded = true;

        // An unseeded store holds only optimistic copies (live frames are
        // buffered); splice the transcript ahead of them.
        let optimistic = std::mem::take(&mut self.messages);
        for record in transcript {
            self.apply_record(record);
        }
        self.messages.extend(optimistic);
        let buffered = std::mem::take(&mut self.pre_seed);
        for record in buffered {
            self.apply_record(record);
        }
        Ok(())
    }

    /// Feed one inbound record (live frame payload) into the store.
    ///
    /// Records for other conversations are ignored. Before seeding, relevant
    /// records are buffered. After seeding, a record either reconciles a
    /// pending optimistic copy, is dropped as a duplicate, or is appended.
    pub fn apply_incoming(&mut self, record: MessageRecord) -> ApplyOutcome {
        if !self.is_relevant(&record) {
            return ApplyOutcome::Ignored;
        }
        if !self.seeded {
            self.pre_seed.push(record);
            return ApplyOutcome::Buffered;
        }
        self.apply_record(record)
    }

    /// Append an optimistic copy of a message this client is sending.
    ///
    /// The copy is visible immediately as [`DeliveryState::Pending`] with no
    /// server id or timestamp; the returned [`LocalId`] travels on the
    /// outbound frame and keys the later reconciliation.
    pub fn append_optimistic(&mut self, content: impl Into<String>) -> LocalId {
        let local_id = LocalId::new();
        self.messages.push(Message {
            id: None,
            local_id: Some(local_id),
            sender_id: self.self_id.clone(),
            receiver_id: self.peer_id.clone(),
            content: content.into(),
            timestamp: None,
            delivery: DeliveryState::Pending,
        });
        local_id
    }

    /// Mark a pending optimistic copy as failed.
    ///
    /// Returns `true` if a pending message with this local id was found.
    /// Already-confirmed or already-failed copies are left alone, so a
    /// late failure signal racing the server echo cannot undo a
    /// confirmation.
    pub fn mark_failed(&mut self, local_id: LocalId) -> bool {
        for message in &mut self.messages {
            if message.local_id == Some(local_id) && message.delivery == DeliveryState::Pending {
                message.delivery = DeliveryState::Failed;
                return true;
            }
        }
        false
    }

    /// Whether the record belongs to this conversation.
    fn is_relevant(&self, record: &MessageRecord) -> bool {
        record.sender_id == self.peer_id || record.receiver_id == self.peer_id
    }

    /// Insert one confirmed record: reconcile, dedup, or append.
    fn apply_record(&mut self, record: MessageRecord) -> ApplyOutcome {
        if self.seen_ids.contains(&record.id) {
            return ApplyOutcome::Duplicate;
        }

        // Echo of a message we sent: try to reconcile a pending copy.
        if record.sender_id == self.self_id
            && let Some(index) = self.find_pending(&record)
        {
            self.seen_ids.insert(record.id.clone());
            let message = &mut self.messages[index];
            let confirmed_local_id = message.local_id.unwrap_or_else(|| {
                // Pending copies always carry a local id; fall back to the
                // echoed one rather than panicking if that ever breaks.
                record.local_id.unwrap_or_default()
            });
            message.id = Some(record.id);
            message.timestamp = Some(record.timestamp);
            message.delivery = DeliveryState::Confirmed;
            return ApplyOutcome::Confirmed(confirmed_local_id);
        }

        self.seen_ids.insert(record.id.clone());
        let delivery = if record.sender_id == self.self_id {
            // Our own message confirmed from another source (history row or
            // an echo with no matching pending copy, e.g. after a restart).
            DeliveryState::Confirmed
        } else {
            DeliveryState::Received
        };
        // Correlation ids are unique within the view; a stray echo whose id
        // is already attached to another entry is appended without it.
        let local_id = record
            .local_id
            .filter(|lid| !self.messages.iter().any(|m| m.local_id == Some(*lid)));
        self.messages.push(Message {
            id: Some(record.id),
            local_id,
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            content: record.content,
            timestamp: Some(record.timestamp),
            delivery,
        });
        ApplyOutcome::Inserted
    }

    /// Find the optimistic copy this echo confirms.
    ///
    /// Matches by echoed local id when the server provides one — including
    /// copies already marked failed, since an echo proves the send made it
    /// after all. The fallback matches the oldest pending copy with the
    /// same content and receiver.
    fn find_pending(&self, record: &MessageRecord) -> Option<usize> {
        if let Some(local_id) = record.local_id {
            return self.messages.iter().position(|m| {
                matches!(m.delivery, DeliveryState::Pending | DeliveryState::Failed)
                    && m.local_id == Some(local_id)
            });
        }
        self.messages.iter().position(|m| {
            m.delivery == DeliveryState::Pending
                && m.content == record.content
                && m.receiver_id == record.receiver_id
        })
    }
}
