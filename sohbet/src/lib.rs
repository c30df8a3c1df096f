//! Sohbet — real-time messaging session manager.
//!
//! Establishes and maintains a live per-user messaging channel, merges it
//! with historical transcripts, and guarantees an ordered, deduplicated
//! conversation view across transient network failures.

pub mod config;
pub mod conversation;
pub mod history;
pub mod reconnect;
pub mod session;
pub mod transport;
