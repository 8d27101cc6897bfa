//! Fisheye realtime protocol types.
//!
//! JSON envelope exchanged between the hub and its two kinds of peers
//! (doorbell devices and dashboard sessions). This crate is the single
//! source of truth for message kinds, roles and the connect acknowledgment.

pub mod connected;
pub mod error;
pub mod message;
pub mod types;

pub use connected::{ConnectedData, PublicUser};
pub use error::ProtocolError;
pub use message::{ClientId, Message, MessageKind, Role};
pub use types::MessageTypes;

/// Current wall-clock time as unix seconds.
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
