//! Session tokens.
//!
//! Only a SHA-256 digest of each token is kept; the plaintext is handed to
//! the user once, at issue time.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;

/// Default session lifetime: 7 days.
pub const DEFAULT_TTL: Duration = Duration::days(7);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token TTL must be positive")]
    InvalidTtl,
}

type TokenHash = [u8; 32];

#[derive(Debug, Clone)]
struct StoredToken {
    user_id: Uuid,
    expiry: DateTime<Utc>,
}

/// A freshly issued token. The only place the plaintext exists.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub plaintext: String,
    pub user_id: Uuid,
    pub expiry: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRecord {
    pub user_id: Uuid,
    pub expiry: DateTime<Utc>,
}

pub struct TokenStore {
    tokens: RwLock<HashMap<TokenHash, StoredToken>>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Result<Self, TokenError> {
        if ttl <= Duration::zero() {
            return Err(TokenError::InvalidTtl);
        }
        Ok(Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new token for `user_id` with the store's TTL.
    pub fn issue(&self, user_id: Uuid) -> IssuedToken {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let plaintext = URL_SAFE_NO_PAD.encode(bytes);

        let now = Utc::now();
        let expiry = now + self.ttl;
        self.tokens
            .write()
            .insert(hash(&plaintext), StoredToken { user_id, expiry });

        IssuedToken {
            plaintext,
            user_id,
            expiry,
            created_at: now,
        }
    }

    /// Resolve an unexpired token.
    pub fn lookup(&self, plaintext: &str) -> Option<TokenRecord> {
        let tokens = self.tokens.read();
        let stored = tokens.get(&hash(plaintext))?;
        (stored.expiry > Utc::now()).then_some(TokenRecord {
            user_id: stored.user_id,
            expiry: stored.expiry,
        })
    }

    /// Push an unexpired token's expiry to now + TTL. Returns whether a
    /// token was extended; expired and unknown tokens are left alone.
    pub fn extend_expiry(&self, plaintext: &str) -> bool {
        let now = Utc::now();
        let mut tokens = self.tokens.write();
        match tokens.get_mut(&hash(plaintext)) {
            Some(stored) if stored.expiry > now => {
                stored.expiry = now + self.ttl;
                true
            }
            _ => false,
        }
    }

    pub fn revoke(&self, plaintext: &str) -> bool {
        self.tokens.write().remove(&hash(plaintext)).is_some()
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, t| t.expiry > now);
        before - tokens.len()
    }

    /// Purge expired tokens every `every` until the store is dropped.
    pub fn spawn_purge(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!("Purged {purged} expired session tokens");
                }
            }
        })
    }

    #[cfg(test)]
    fn force_expiry(&self, plaintext: &str, expiry: DateTime<Utc>) {
        if let Some(t) = self.tokens.write().get_mut(&hash(plaintext)) {
            t.expiry = expiry;
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl: DEFAULT_TTL,
        }
    }
}

fn hash(plaintext: &str) -> TokenHash {
    Sha256::digest(plaintext.as_bytes()).into()
}
