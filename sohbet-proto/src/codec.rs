//! Serialization and deserialization for the Sohbet wire protocol.
//!
//! The backend speaks JSON over WebSocket text frames, one frame per JSON
//! object. Message boundaries come from the WebSocket layer, so no extra
//! framing is needed; decode does enforce an input size cap so a hostile
//! or broken peer cannot make the client buffer unbounded text.

use crate::frame::{ClientFrame, ServerFrame};

/// Maximum accepted size of a single inbound frame in bytes (64 KB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// Deserialization failed (malformed JSON or unknown frame type).
    #[error("decode error: {0}")]
    Decode(String),
    /// Inbound frame exceeds the maximum allowed size.
    #[error("frame too large ({size} bytes, max {max} bytes)")]
    Oversized {
        /// Actual frame size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Encodes a [`ClientFrame`] into a JSON string for a WebSocket text frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the frame cannot be serialized.
pub fn encode_client(frame: &ClientFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a [`ClientFrame`] from inbound JSON text (server side).
///
/// # Errors
///
/// Returns [`CodecError::Oversized`] if the text exceeds [`MAX_FRAME_SIZE`],
/// or [`CodecError::Decode`] for malformed JSON or an unknown `type` tag.
pub fn decode_client(text: &str) -> Result<ClientFrame, CodecError> {
    check_size(text)?;
    serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encodes a [`ServerFrame`] into a JSON string for a WebSocket text frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the frame cannot be serialized.
pub fn encode_server(frame: &ServerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decodes a [`ServerFrame`] from inbound JSON text (client side).
///
/// # Errors
///
/// Returns [`CodecError::Oversized`] if the text exceeds [`MAX_FRAME_SIZE`],
/// or [`CodecError::Decode`] for malformed JSON or an unknown `type` tag.
pub fn decode_server(text: &str) -> Result<ServerFrame, CodecError> {
    check_size(text)?;
    serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
}

fn check_size(text: &str) -> Result<(), CodecError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::Oversized {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}
