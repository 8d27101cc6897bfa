//! Upgrade-time authentication.
//!
//! Devices present the shared device key, frontends present a session
//! token. Both are accepted either as a query parameter (`api_key` /
//! `token`, what browsers and the doorbell firmware use) or in the
//! `Authorization` header (`ApiKey <key>` / `Bearer <token>`).

use std::future::Future;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use fisheye_protocol::PublicUser;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Collaborator that resolves session tokens to users.
///
/// Implemented by the user/token store; the transport only ever calls it
/// before upgrading and once more, in the background, to keep an active
/// session's token alive.
pub trait TokenVerifier: Send + Sync + 'static {
    /// Resolve a token to its user. `Ok(None)` means unknown or expired.
    fn validate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<PublicUser>, AuthError>> + Send;

    /// Push the token's expiry forward by the store's TTL.
    fn extend_expiry(&self, token: &str) -> impl Future<Output = Result<(), AuthError>> + Send;
}

/// Why an upgrade request was refused.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0} required")]
    MissingCredential(&'static str),

    #[error("Invalid API key")]
    InvalidDeviceKey,

    #[error("Invalid or expired token")]
    InvalidToken,

    /// The token store itself failed.
    #[error("token store error: {0}")]
    Store(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        // Store failures are not leaked to the client.
        let message = match &self {
            Self::Store(_) => Self::InvalidToken.to_string(),
            other => other.to_string(),
        };
        (StatusCode::UNAUTHORIZED, message).into_response()
    }
}

/// The shared device secret.
#[derive(Clone)]
pub struct DeviceKey(Arc<SecretString>);

impl DeviceKey {
    pub fn new(key: String) -> Self {
        Self(Arc::new(SecretString::from(key)))
    }

    pub fn is_configured(&self) -> bool {
        !self.0.expose_secret().is_empty()
    }

    /// Compare a presented key against the configured one. Digests are
    /// compared without early exit.
    pub fn matches(&self, candidate: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        let expected = Sha256::digest(self.0.expose_secret().as_bytes());
        let presented = Sha256::digest(candidate.as_bytes());
        expected
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceKey").field(&"[REDACTED]").finish()
    }
}

/// Device credential: `?api_key=` or `Authorization: ApiKey <key>`.
pub fn device_credential(query: Option<&str>, headers: &HeaderMap) -> Option<String> {
    non_empty(query).or_else(|| authorization(headers, "ApiKey"))
}

/// Frontend credential: `?token=` or `Authorization: Bearer <token>`.
pub fn bearer_credential(query: Option<&str>, headers: &HeaderMap) -> Option<String> {
    non_empty(query).or_else(|| authorization(headers, "Bearer"))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn authorization(headers: &HeaderMap, scheme: &str) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (given, credential) = value.split_once(' ')?;
    if !given.eq_ignore_ascii_case(scheme) {
        return None;
    }
    non_empty(Some(credential.trim()))
}

/// Whether an upgrade's `Origin` is acceptable. Requests without an origin
/// (devices, native clients) always pass.
pub fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    allowed.iter().any(|a| a == "*" || a == origin)
}
