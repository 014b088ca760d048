//! JSON framing for the real-time transport.
//!
//! Every frame is one UTF-8 JSON document carried in a single WebSocket
//! text message, so no length prefix is needed.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::{ClientCommand, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Encodes any frame as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a JSON frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a valid frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a client command.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the command cannot be serialized.
pub fn encode_command(command: &ClientCommand) -> Result<String, CodecError> {
    encode(command)
}

/// Decodes a server event.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for malformed or unknown frames.
pub fn decode_event(text: &str) -> Result<ServerEvent, CodecError> {
    decode(text)
}
