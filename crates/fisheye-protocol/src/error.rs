//! Protocol-level errors.

use thiserror::Error;

/// Failure to turn a raw frame into a [`Message`](crate::Message) or back.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a valid envelope (bad JSON, missing `type`,
    /// unknown `target`, ...).
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The message could not be serialized for the wire.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}
