//! HTTP surface: the two upgrade endpoints and the health check.
//!
//! Every upgrade is authenticated before the protocol switch, so a rejected
//! peer gets a plain HTTP status and never reaches the hub.

use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State, WebSocketUpgrade,
        ws::{WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use fisheye_hub::HubHandle;
use fisheye_protocol::{ConnectedData, Message, PublicUser, Role};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::auth::{self, AuthError, TokenVerifier};
use crate::client::Client;
use crate::config::{ConfigError, TransportConfig};

/// Failure to bring the server up.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid listen address: {0}")]
    Addr(#[from] AddrParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state for the transport server.
struct AppState<V: TokenVerifier> {
    hub: HubHandle,
    verifier: Arc<V>,
    config: TransportConfig,
}

/// Credentials as they arrive in the query string.
#[derive(Debug, Default, Deserialize)]
struct CredentialQuery {
    api_key: Option<String>,
    token: Option<String>,
}

/// The running HTTP/WebSocket server.
pub struct TransportServer {
    hub: HubHandle,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Validate the configuration, bind, and start serving.
    pub async fn start<V: TokenVerifier>(
        config: TransportConfig,
        hub: HubHandle,
        verifier: V,
    ) -> Result<Self, TransportError> {
        Self::start_with_verifier(config, hub, Arc::new(verifier)).await
    }

    /// Like [`TransportServer::start`], for a verifier shared with other
    /// subsystems.
    pub async fn start_with_verifier<V: TokenVerifier>(
        config: TransportConfig,
        hub: HubHandle,
        verifier: Arc<V>,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let addr: SocketAddr = config.socket_addr().parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        let cors = config.enable_cors.then(|| cors_layer(&config.allowed_origins));
        let state = Arc::new(AppState {
            hub: hub.clone(),
            verifier,
            config: config.clone(),
        });

        let mut app = Router::new()
            .route("/api/ws/device", get(device_upgrade_handler::<V>))
            .route("/api/ws/frontend", get(frontend_upgrade_handler::<V>))
            .route("/api/health", get(health_handler::<V>))
            .with_state(state);
        if let Some(cors) = cors {
            app = app.layer(cors);
        }

        info!(
            "Realtime hub listening on ws://{}:{}/api/ws/{{device,frontend}}",
            config.hostname, actual_port
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            {
                warn!("HTTP server error: {e}");
            }
        });

        Ok(Self {
            hub,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Close every client (each gets a close frame) and stop accepting.
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        self.hub.shutdown().await;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                warn!("HTTP server did not stop in time");
            }
        }
        info!("Realtime transport stopped");
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn device_upgrade_handler<V: TokenVerifier>(
    State(state): State<Arc<AppState<V>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(key) = auth::device_credential(query.api_key.as_deref(), &headers) else {
        warn!("Device connection from {peer} without API key");
        return AuthError::MissingCredential("API key").into_response();
    };
    if !state.config.auth.device_key.matches(&key) {
        warn!("Device connection from {peer} with invalid API key");
        return AuthError::InvalidDeviceKey.into_response();
    }

    accept(state, ws, &headers, peer, Role::Device, None, None).await
}

async fn frontend_upgrade_handler<V: TokenVerifier>(
    State(state): State<Arc<AppState<V>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = auth::bearer_credential(query.token.as_deref(), &headers) else {
        warn!("Frontend connection from {peer} without token");
        return AuthError::MissingCredential("Token").into_response();
    };
    let user = match state.verifier.validate(&token).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!("Frontend connection from {peer} with invalid or expired token");
            return AuthError::InvalidToken.into_response();
        }
        Err(e) => {
            warn!("Token validation failed for {peer}: {e}");
            return e.into_response();
        }
    };

    accept(state, ws, &headers, peer, Role::Frontend, Some(user), Some(token)).await
}

async fn health_handler<V: TokenVerifier>(State(state): State<Arc<AppState<V>>>) -> Response {
    let devices = state.hub.count_by_role(Role::Device).await;
    let frontends = state.hub.count_by_role(Role::Frontend).await;
    Json(json!({
        "status": "ok",
        "clients": devices + frontends,
        "devices": devices,
        "frontends": frontends,
        "timestamp": fisheye_protocol::unix_timestamp(),
    }))
    .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Upgrade
// ─────────────────────────────────────────────────────────────────────────────

/// Checks that apply once the peer is authenticated, then the upgrade.
async fn accept<V: TokenVerifier>(
    state: Arc<AppState<V>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: &HeaderMap,
    peer: SocketAddr,
    role: Role,
    user: Option<PublicUser>,
    token: Option<String>,
) -> Response {
    if !auth::origin_allowed(headers, &state.config.allowed_origins) {
        warn!("Rejected {role} upgrade from {peer}: origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    if let Some(max) = state.config.max_connections {
        let current = state.hub.total_count().await;
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!("Upgrade from {peer} rejected: {rejection}");
            return rejection.into_response();
        }
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| serve_client(socket, state, peer, role, user, token))
        .into_response()
}

async fn serve_client<V: TokenVerifier>(
    socket: WebSocket,
    state: Arc<AppState<V>>,
    peer: SocketAddr,
    role: Role,
    user: Option<PublicUser>,
    token: Option<String>,
) {
    let mut client = Client::new(
        role,
        user.clone(),
        state.config.queue_capacity,
        state.config.keepalive.clone(),
    );
    match &user {
        Some(user) => info!(
            "Client connected: {} ({role}, user {}) from {peer}",
            client.id(),
            user.username
        ),
        None => info!("Client connected: {} ({role}) from {peer}", client.id()),
    }

    if let Some(token) = token {
        let verifier = state.verifier.clone();
        let limit = state.config.auth.token_extension_timeout;
        let client_id = client.id().to_string();
        client.attach_task(tokio::spawn(async move {
            match tokio::time::timeout(limit, verifier.extend_expiry(&token)).await {
                Ok(Ok(())) => debug!("Token expiry extended for client {client_id}"),
                Ok(Err(e)) => warn!("Failed to extend token expiry for {client_id}: {e}"),
                Err(_) => warn!("Token expiry extension for {client_id} timed out after {limit:?}"),
            }
        }));
    }

    let ack = Message::connected(&ConnectedData::new(client.id().to_string(), role, user));
    if !client.enqueue_self(ack) {
        warn!("Could not queue connected ack for client {}", client.id());
    }

    client.run(socket, state.hub.clone()).await;
}
