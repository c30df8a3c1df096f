//! Sohbet chat backend server.
//!
//! An axum server exposing the live WebSocket channel and the read-side
//! REST endpoints the Sohbet client consumes. Also embedded in the
//! client's integration tests as an in-process backend.

pub mod config;
pub mod server;
pub mod store;
