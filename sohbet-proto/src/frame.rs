//! Typed frames exchanged over the persistent chat connection.
//!
//! Both directions use a tagged JSON union so new frame kinds can be added
//! without breaking older readers. Frames with an unknown `type` tag fail
//! decoding with a [`CodecError`](crate::codec::CodecError) rather than
//! being silently ignored — the transport layer logs and skips them.

use serde::{Deserialize, Serialize};

use crate::message::{LocalId, MessageRecord, UserId};

/// A frame sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Send a text message to another participant.
    ///
    /// `local_id` is the client-side correlation id; the server includes it
    /// in the echoed [`ServerFrame::Message`] so the sender can reconcile
    /// its optimistic copy.
    Message {
        /// The addressee.
        receiver_id: UserId,
        /// Text body.
        content: String,
        /// Correlation id for echo reconciliation.
        local_id: LocalId,
    },
}

/// A frame sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A confirmed message — either addressed to this client or the echo
    /// of one it sent.
    Message(MessageRecord),
    /// The server rejected an operation (e.g. a moderation block). Never
    /// inserted into a conversation; surfaced as a transient notice.
    Error {
        /// Human-readable rejection reason.
        message: String,
    },
}
