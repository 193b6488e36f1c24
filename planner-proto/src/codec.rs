//! JSON encoding for frames exchanged over the push channel.
//!
//! Both directions use WebSocket text frames carrying a single JSON
//! object. Binary frames are not part of the protocol.

use crate::command::ClientCommand;
use crate::event::ServerFrame;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("failed to encode {what}: {source}")]
    Encode {
        /// What was being encoded.
        what: &'static str,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// The text was not a valid frame.
    #[error("malformed {what}: {source}")]
    Decode {
        /// What was being decoded.
        what: &'static str,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

/// Encodes a [`ClientCommand`] as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the command cannot be serialized.
pub fn encode_command(cmd: &ClientCommand) -> Result<String, CodecError> {
    serde_json::to_string(cmd).map_err(|source| CodecError::Encode {
        what: "command",
        source,
    })
}

/// Decodes a [`ClientCommand`] from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the text is not a valid command.
pub fn decode_command(text: &str) -> Result<ClientCommand, CodecError> {
    serde_json::from_str(text).map_err(|source| CodecError::Decode {
        what: "command",
        source,
    })
}

/// Encodes a [`ServerFrame`] as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the frame cannot be serialized.
pub fn encode_frame(frame: &ServerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|source| CodecError::Encode {
        what: "frame",
        source,
    })
}

/// Decodes a [`ServerFrame`] from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the text is not a valid frame.
pub fn decode_frame(text: &str) -> Result<ServerFrame, CodecError> {
    serde_json::from_str(text).map_err(|source| CodecError::Decode {
        what: "frame",
        source,
    })
}
