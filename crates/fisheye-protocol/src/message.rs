//! The wire envelope and the roles it is routed by.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::connected::ConnectedData;
use crate::error::ProtocolError;
use crate::types::MessageTypes;

/// Opaque, process-unique identifier of a connected client.
pub type ClientId = String;

/// Which class of peer a client is. Used for targeted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A physical doorbell authenticated with the shared device key.
    Device,
    /// A dashboard session authenticated with a user token.
    Frontend,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Frontend => "frontend",
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device)
    }

    /// Whether a client of this role should receive a message aimed at
    /// `target`. An absent target means everybody.
    pub fn accepts(&self, target: Option<Role>) -> bool {
        target.is_none_or(|t| t == *self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub-level classification of a message's `type`.
///
/// Only the kinds the hub acts on get their own variant; everything else is
/// carried through as [`MessageKind::Generic`] with its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    Pong,
    Connected,
    Generic(String),
}

impl MessageKind {
    pub fn classify(type_name: &str) -> Self {
        match type_name {
            MessageTypes::PING => Self::Ping,
            MessageTypes::PONG => Self::Pong,
            MessageTypes::CONNECTED => Self::Connected,
            other => Self::Generic(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => MessageTypes::PING,
            Self::Pong => MessageTypes::PONG,
            Self::Connected => MessageTypes::CONNECTED,
            Self::Generic(name) => name,
        }
    }
}

/// JSON envelope: `{ type, data, target?, client_id? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    /// Delivery scope. `None` delivers to every connected client.
    #[serde(
        default,
        deserialize_with = "deserialize_target",
        skip_serializing_if = "Option::is_none"
    )]
    pub target: Option<Role>,
    /// Set by the server to the id of the client a relayed message came from.
    #[serde(rename = "client_id", default, skip_serializing_if = "Option::is_none")]
    pub origin_client_id: Option<ClientId>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            target: None,
            origin_client_id: None,
        }
    }

    pub fn with_target(mut self, role: Role) -> Self {
        self.target = Some(role);
        self
    }

    pub fn with_origin(mut self, client_id: impl Into<ClientId>) -> Self {
        self.origin_client_id = Some(client_id.into());
        self
    }

    /// Reply to an application-level ping.
    pub fn pong() -> Self {
        Self::new(
            MessageTypes::PONG,
            json!({ "timestamp": crate::unix_timestamp() }),
        )
    }

    /// Acknowledgment sent to a freshly registered client.
    pub fn connected(data: &ConnectedData) -> Self {
        let data = serde_json::to_value(data).unwrap_or(Value::Null);
        Self::new(MessageTypes::CONNECTED, data)
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::classify(&self.message_type)
    }

    /// Whether a client of `role` falls inside this message's target.
    pub fn is_for(&self, role: Role) -> bool {
        role.accepts(self.target)
    }

    /// Parse a raw text or binary frame.
    pub fn from_slice(frame: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(frame).map_err(ProtocolError::Malformed)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// An empty string is treated like an absent target; any other unknown
/// value is rejected.
fn deserialize_target<'de, D>(deserializer: D) -> Result<Option<Role>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some("device") => Ok(Some(Role::Device)),
        Some("frontend") => Ok(Some(Role::Frontend)),
        Some(other) => Err(serde::de::Error::unknown_variant(
            other,
            &["device", "frontend"],
        )),
    }
}
