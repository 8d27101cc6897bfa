//! Payload of the `connected` acknowledgment.
//!
//! Sent by the server as the first message on every accepted connection:
//!
//! ```json
//! {"type":"connected","data":{"client_id":"…","is_device":false,"timestamp":1700000000,
//!   "user":{"id":"…","username":"…","email":"…","role":"admin"}}}
//! ```

use serde::{Deserialize, Serialize};

use crate::message::{ClientId, Role};

/// Public attributes of an authenticated dashboard user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub email: String,
    /// Account role ("admin", "user", ...), unrelated to the connection [`Role`].
    pub role: String,
}

/// `data` of the `connected` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedData {
    pub client_id: ClientId,
    pub is_device: bool,
    /// Unix seconds at which the connection was accepted.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<PublicUser>,
}

impl ConnectedData {
    pub fn new(client_id: impl Into<ClientId>, role: Role, user: Option<PublicUser>) -> Self {
        Self {
            client_id: client_id.into(),
            is_device: role.is_device(),
            timestamp: crate::unix_timestamp(),
            user,
        }
    }
}
