//! Peer directory entries.
//!
//! The directory REST endpoint lists candidate conversation partners. The
//! messaging layer consumes these only for peer selection; nothing here is
//! mutated client-side.

use serde::{Deserialize, Serialize};

use crate::message::UserId;

/// A candidate conversation partner as listed by the directory endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// The peer's identifier.
    pub id: UserId,
    /// Display name for selection UI.
    pub display_name: String,
    /// Avatar image reference, if the peer has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}
