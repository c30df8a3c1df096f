//! In-memory persistence for messages and the user directory.
//!
//! The [`ChatStore`] appends every confirmed message in the order the
//! server accepted it, which doubles as chronological order because the
//! server assigns the timestamps. History queries filter that log down
//! to one conversation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use sohbet_proto::directory::DirectoryEntry;
use sohbet_proto::message::{MessageId, MessageRecord, Timestamp, UserId};

/// Append-only message log plus the user directory.
pub struct ChatStore {
    /// All accepted messages, in acceptance order.
    messages: RwLock<Vec<MessageRecord>>,
    /// Users seen so far, keyed by id string for stable listing order.
    users: RwLock<BTreeMap<String, DirectoryEntry>>,
    /// Monotonic message id counter.
    next_id: AtomicU64,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            users: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Accept a message: assign its id and timestamp and append it.
    ///
    /// The stored record never carries a client correlation id; the handler
    /// attaches one to the echo frame only.
    pub async fn record(&self, sender: &UserId, receiver: &UserId, content: &str) -> MessageRecord {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = MessageRecord {
            id: MessageId::new(format!("m{n}")),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            content: content.to_string(),
            timestamp: Timestamp::now(),
            local_id: None,
        };
        self.messages.write().await.push(record.clone());
        record
    }

    /// The transcript between two users, oldest first.
    pub async fn history(&self, a: &UserId, b: &UserId) -> Vec<MessageRecord> {
        let messages = self.messages.read().await;
        messages
            .iter()
            .filter(|m| {
                (m.sender_id == *a && m.receiver_id == *b)
                    || (m.sender_id == *b && m.receiver_id == *a)
            })
            .cloned()
            .collect()
    }

    /// Register a user in the directory. Idempotent.
    pub async fn add_user(&self, id: &UserId) {
        let mut users = self.users.write().await;
        users
            .entry(id.as_str().to_string())
            .or_insert_with(|| DirectoryEntry {
                id: id.clone(),
                display_name: id.as_str().to_string(),
                avatar_url: None,
            });
    }

    /// List up to `limit` directory entries.
    pub async fn list_users(&self, limit: usize) -> Vec<DirectoryEntry> {
        let users = self.users.read().await;
        users.values().take(limit).cloned().collect()
    }
}
