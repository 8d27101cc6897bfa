//! Transport configuration.

use std::time::Duration;

use fisheye_hub::DEFAULT_QUEUE_CAPACITY;
use thiserror::Error;

use crate::auth::DeviceKey;

/// Rejected configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device API key is required for device authentication")]
    MissingDeviceKey,

    #[error("ping period ({ping_period:?}) must be shorter than pong wait ({pong_wait:?})")]
    KeepaliveOrder {
        ping_period: Duration,
        pong_wait: Duration,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Liveness timers for every connection.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// How long a connection may stay silent (no frame, no pong) before it
    /// is considered dead.
    pub pong_wait: Duration,
    /// Interval between server pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for flushing a single outbound frame.
    pub write_wait: Duration,
}

impl KeepaliveConfig {
    /// Derive the ping period as nine tenths of `pong_wait`.
    pub fn from_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_period.is_zero() {
            return Err(ConfigError::Zero("ping period"));
        }
        if self.write_wait.is_zero() {
            return Err(ConfigError::Zero("write wait"));
        }
        if self.ping_period >= self.pong_wait {
            return Err(ConfigError::KeepaliveOrder {
                ping_period: self.ping_period,
                pong_wait: self.pong_wait,
            });
        }
        Ok(())
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::from_pong_wait(Duration::from_secs(60))
    }
}

/// Authentication settings for the two upgrade endpoints.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Shared secret every doorbell device presents.
    pub device_key: DeviceKey,
    /// Upper bound for the background token-expiry extension.
    pub token_extension_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            device_key: DeviceKey::new(String::new()),
            token_extension_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Enable CORS on the HTTP routes
    pub enable_cors: bool,
    /// Accepted `Origin` values for upgrades. `*` accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Capacity of each client's outbound queue
    pub queue_capacity: usize,
    /// Liveness timers
    pub keepalive: KeepaliveConfig,
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.auth.device_key.is_configured() {
            return Err(ConfigError::MissingDeviceKey);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("max message size"));
        }
        self.keepalive.validate()
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: "0.0.0.0".into(),
            auth: AuthConfig::default(),
            enable_cors: false,
            allowed_origins: vec!["*".into()],
            max_connections: None,
            max_message_size: 512 * 1024,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive: KeepaliveConfig::default(),
        }
    }
}
