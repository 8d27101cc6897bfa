//! [`TokenVerifier`] over the in-memory stores.

use std::sync::Arc;

use fisheye_protocol::PublicUser;
use fisheye_transport::{AuthError, TokenVerifier};
use tracing::debug;

use crate::tokens::TokenStore;
use crate::users::UserDirectory;

/// Resolves session tokens through [`TokenStore`] and [`UserDirectory`].
#[derive(Clone)]
pub struct StoreVerifier {
    users: Arc<UserDirectory>,
    tokens: Arc<TokenStore>,
}

impl StoreVerifier {
    pub fn new(users: Arc<UserDirectory>, tokens: Arc<TokenStore>) -> Self {
        Self { users, tokens }
    }
}

impl TokenVerifier for StoreVerifier {
    async fn validate(&self, token: &str) -> Result<Option<PublicUser>, AuthError> {
        let Some(record) = self.tokens.lookup(token) else {
            return Ok(None);
        };
        // A token can outlive its user.
        Ok(self.users.get(record.user_id).map(|u| u.to_public()))
    }

    async fn extend_expiry(&self, token: &str) -> Result<(), AuthError> {
        if !self.tokens.extend_expiry(token) {
            debug!("Token expiry not extended: token unknown or expired");
        }
        Ok(())
    }
}
