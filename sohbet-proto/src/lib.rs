//! Shared wire-format definitions for the Sohbet messaging protocol.

pub mod codec;
pub mod directory;
pub mod frame;
pub mod message;
