//! Fisheye Services
//!
//! In-memory collaborators of the realtime hub:
//! - [`UserDirectory`]: dashboard accounts
//! - [`TokenStore`]: hashed session tokens with sliding expiry
//! - [`StoreVerifier`]: the transport's [`fisheye_transport::TokenVerifier`]
//! - [`Notifier`]: typed pushes to devices and dashboards

pub mod notify;
pub mod tokens;
pub mod users;
pub mod verifier;

pub use notify::Notifier;
pub use tokens::{DEFAULT_TTL, IssuedToken, TokenError, TokenRecord, TokenStore};
pub use users::{ROLE_ADMIN, ROLE_USER, User, UserDirectory};
pub use verifier::StoreVerifier;

use thiserror::Error;

/// Rejected store operation.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("{0}")]
    Conflict(String),
}
