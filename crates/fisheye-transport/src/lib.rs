//! Fisheye Transport Layer
//!
//! Terminates device and frontend WebSocket connections for the hub.
//! The transport layer handles:
//! - Authentication before upgrade (device key or session token)
//! - Per-connection lifecycle with separate read and write pumps
//! - Keepalive pings and read deadlines for stale peer detection
//! - The health endpoint
//!
//! Token verification is decoupled from the transport via the
//! [`TokenVerifier`] trait.

pub mod auth;
pub mod client;
pub mod config;
pub mod conn;
pub mod server;

pub use auth::{AuthError, DeviceKey, TokenVerifier};
pub use client::{Client, ClientState};
pub use config::{AuthConfig, ConfigError, KeepaliveConfig, TransportConfig};
pub use conn::ConnError;
pub use server::{TransportError, TransportServer};
