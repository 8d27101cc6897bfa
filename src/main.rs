//! Fisheye Realtime — WebSocket hub for doorbells and dashboards
//!
//! Doorbell devices connect to `/api/ws/device` with the shared device key,
//! dashboards connect to `/api/ws/frontend` with a session token. The hub
//! relays messages between them and pushes settings/schedule updates.
//!
//! Usage:
//!   fisheye-realtime --device-api-key <key>              # Listen on 0.0.0.0:8080
//!   fisheye-realtime --port 9000 --verbose               # Custom port, debug logs
//!   fisheye-realtime --bootstrap-admin alice             # Create an admin, print a token
//!
//! Every flag can also be set through its environment variable
//! (`SERVER_PORT`, `DEVICE_API_KEY`, ...).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fisheye_hub::{Hub, HubConfig};
use fisheye_services::{ROLE_ADMIN, StoreVerifier, TokenStore, UserDirectory};
use fisheye_transport::{
    AuthConfig, DeviceKey, KeepaliveConfig, TransportConfig, TransportServer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "fisheye-realtime", about = "Fisheye realtime hub for doorbells and dashboards")]
struct Cli {
    /// Hostname to bind to
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 for OS-assigned)
    #[arg(long, env = "SERVER_PORT", default_value = "8080")]
    port: u16,

    /// Shared secret presented by doorbell devices
    #[arg(long, env = "DEVICE_API_KEY", hide_env_values = true)]
    device_api_key: String,

    /// Accepted upgrade origins, comma separated (`*` for any)
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", value_delimiter = ',', default_value = "*")]
    allowed_origins: Vec<String>,

    /// Maximum concurrent connections
    #[arg(long, env = "WS_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Largest inbound frame, in bytes
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value = "524288")]
    max_message_size: usize,

    /// Seconds a connection may stay silent before it is dropped
    #[arg(long, env = "WS_PONG_WAIT_SECS", default_value = "60")]
    pong_wait_secs: u64,

    /// Lifetime of session tokens, in hours
    #[arg(long, env = "TOKEN_TTL_HOURS", default_value = "168")]
    token_ttl_hours: i64,

    /// Create an admin user with this name and print a session token for it
    #[arg(long, env = "BOOTSTRAP_ADMIN")]
    bootstrap_admin: Option<String>,

    /// Enable CORS headers on HTTP routes
    #[arg(long, env = "ENABLE_CORS")]
    enable_cors: bool,

    /// Enable verbose logging
    #[arg(long, env = "DEBUG")]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            port: self.port,
            hostname: self.host.clone(),
            auth: AuthConfig {
                device_key: DeviceKey::new(self.device_api_key.clone()),
                ..AuthConfig::default()
            },
            enable_cors: self.enable_cors,
            allowed_origins: self
                .allowed_origins
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            max_connections: self.max_connections,
            max_message_size: self.max_message_size,
            keepalive: KeepaliveConfig::from_pong_wait(Duration::from_secs(self.pong_wait_secs)),
            ..TransportConfig::default()
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let Some(log_path) = &cli.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    };

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
            eprintln!("Logging to {}", log_path.display());
        }
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            error!("Failed to open log file {}: {e}, logging to stderr", log_path.display());
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = cli.transport_config();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    let tokens = match TokenStore::new(
        chrono::Duration::try_hours(cli.token_ttl_hours).unwrap_or_else(chrono::Duration::zero),
    ) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    tokens.spawn_purge(TOKEN_PURGE_INTERVAL);
    let users = Arc::new(UserDirectory::new());

    if let Some(username) = &cli.bootstrap_admin {
        match users.create(username, &format!("{username}@localhost"), ROLE_ADMIN) {
            Ok(admin) => {
                let token = tokens.issue(admin.id);
                println!("  Admin {} created. Session token (expires {}):", admin.username, token.expiry);
                println!("    {}", token.plaintext);
            }
            Err(e) => {
                error!("Failed to create admin user: {e}");
                std::process::exit(1);
            }
        }
    }

    let hub = Hub::spawn(HubConfig::default());
    let verifier = Arc::new(StoreVerifier::new(users, tokens));

    let mut transport =
        match TransportServer::start_with_verifier(config, hub, verifier).await {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to start transport: {e}");
                std::process::exit(1);
            }
        };

    info!(
        "Fisheye realtime hub running on {}:{} (devices: /api/ws/device, dashboards: /api/ws/frontend)",
        cli.host,
        transport.port()
    );

    shutdown_signal().await;

    info!("Shutting down...");
    transport.stop().await;
}
