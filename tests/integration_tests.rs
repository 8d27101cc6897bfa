//! End-to-end tests: real server on an OS-assigned port, real WebSocket
//! clients, device and frontend authentication, routing and keepalive.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fisheye_hub::{Hub, HubConfig, HubHandle};
use fisheye_protocol::{PublicUser, Role};
use fisheye_services::{Notifier, ROLE_USER, StoreVerifier, TokenStore, UserDirectory};
use fisheye_transport::{
    AuthConfig, AuthError, DeviceKey, KeepaliveConfig, TokenVerifier, TransportConfig,
    TransportServer,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const DEVICE_KEY: &str = "test-device-key";
const WAIT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    transport: TransportServer,
    hub: HubHandle,
    token: String,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tweak: impl FnOnce(&mut TransportConfig)) -> Self {
        let users = Arc::new(UserDirectory::new());
        let tokens = Arc::new(TokenStore::default());
        let user = users
            .create("alice", "alice@example.com", ROLE_USER)
            .unwrap();
        let token = tokens.issue(user.id).plaintext;

        Self::start_with_verifier(StoreVerifier::new(users, tokens), token, tweak).await
    }

    async fn start_with_verifier<V: TokenVerifier>(
        verifier: V,
        token: String,
        tweak: impl FnOnce(&mut TransportConfig),
    ) -> Self {
        let mut config = TransportConfig {
            port: 0,
            hostname: "127.0.0.1".into(),
            auth: AuthConfig {
                device_key: DeviceKey::new(DEVICE_KEY.to_string()),
                ..AuthConfig::default()
            },
            ..TransportConfig::default()
        };
        tweak(&mut config);

        let hub = Hub::spawn(HubConfig::default());
        let transport = TransportServer::start(config, hub.clone(), verifier)
            .await
            .unwrap();

        Self { transport, hub, token }
    }

    fn port(&self) -> u16 {
        self.transport.port()
    }

    fn device_url(&self, key: &str) -> String {
        format!("ws://127.0.0.1:{}/api/ws/device?api_key={key}", self.port())
    }

    fn frontend_url(&self, token: &str) -> String {
        format!("ws://127.0.0.1:{}/api/ws/frontend?token={token}", self.port())
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port())
    }

    async fn connect_device(&self) -> (Ws, Value) {
        let (mut ws, _) = connect_async(self.device_url(DEVICE_KEY)).await.unwrap();
        let ack = recv_json(&mut ws).await;
        (ws, ack)
    }

    async fn connect_frontend(&self) -> (Ws, Value) {
        let (mut ws, _) = connect_async(self.frontend_url(&self.token)).await.unwrap();
        let ack = recv_json(&mut ws).await;
        (ws, ack)
    }

    async fn health(&self) -> Value {
        reqwest::get(self.http_url("/api/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

/// Next text frame as JSON. Control frames are skipped.
async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no text frame arrives within `wait`.
async fn assert_silent(ws: &mut Ws, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

fn http_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

async fn wait_for_count(hub: &HubHandle, expected: usize) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if hub.total_count().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ─────────────────────────────────────────────────────────────────────────────
// Authentication
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn device_receives_connected_ack() {
    let server = TestServer::start().await;
    let (_ws, ack) = server.connect_device().await;

    assert_eq!(ack["type"], "connected");
    assert_eq!(ack["data"]["is_device"], true);
    assert!(ack["data"]["client_id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(ack["data"]["timestamp"].as_i64().is_some());
    assert!(ack["data"].get("user").is_none());
    assert_eq!(server.hub.count_by_role(Role::Device).await, 1);
}

#[tokio::test]
async fn device_key_in_authorization_header() {
    let server = TestServer::start().await;
    let url = format!("ws://127.0.0.1:{}/api/ws/device", server.port());
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("ApiKey {DEVICE_KEY}").parse().unwrap());

    let (mut ws, _) = connect_async(request).await.unwrap();
    assert_eq!(recv_json(&mut ws).await["type"], "connected");
}

#[tokio::test]
async fn bad_device_key_is_rejected_before_upgrade() {
    let server = TestServer::start().await;

    let err = connect_async(server.device_url("wrong")).await.unwrap_err();
    assert_eq!(http_status(err), 401);

    let url = format!("ws://127.0.0.1:{}/api/ws/device", server.port());
    let err = connect_async(url).await.unwrap_err();
    assert_eq!(http_status(err), 401);

    assert_eq!(server.hub.total_count().await, 0);
}

#[tokio::test]
async fn plain_http_gets_auth_errors_first() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let res = client.get(server.http_url("/api/ws/device")).send().await.unwrap();
    assert_eq!(res.status(), 401);
    assert_eq!(res.text().await.unwrap(), "API key required");

    let res = client
        .get(server.http_url("/api/ws/frontend?token=nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    assert_eq!(res.text().await.unwrap(), "Invalid or expired token");

    // Authenticated, but not a WebSocket request.
    let res = client
        .get(server.http_url(&format!("/api/ws/device?api_key={DEVICE_KEY}")))
        .send()
        .await
        .unwrap();
    assert!(res.status().is_client_error());
    assert_ne!(res.status(), 401);
}

#[tokio::test]
async fn frontend_ack_carries_user() {
    let server = TestServer::start().await;
    let (_ws, ack) = server.connect_frontend().await;

    assert_eq!(ack["type"], "connected");
    assert_eq!(ack["data"]["is_device"], false);
    assert_eq!(ack["data"]["user"]["username"], "alice");
    assert_eq!(ack["data"]["user"]["email"], "alice@example.com");
    assert_eq!(ack["data"]["user"]["role"], "user");
    assert_eq!(server.hub.count_by_role(Role::Frontend).await, 1);
}

#[tokio::test]
async fn invalid_token_is_rejected() {
    let server = TestServer::start().await;
    let err = connect_async(server.frontend_url("bogus")).await.unwrap_err();
    assert_eq!(http_status(err), 401);
}

#[tokio::test]
async fn disallowed_origin_is_forbidden() {
    let server = TestServer::start_with(|c| {
        c.allowed_origins = vec!["https://door.example".into()];
    })
    .await;

    let mut request = server.device_url(DEVICE_KEY).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.example".parse().unwrap());
    let err = connect_async(request).await.unwrap_err();
    assert_eq!(http_status(err), 403);

    let mut request = server.device_url(DEVICE_KEY).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://door.example".parse().unwrap());
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test]
async fn connection_limit_returns_503() {
    let server = TestServer::start_with(|c| c.max_connections = Some(1)).await;
    let (_first, _) = server.connect_device().await;

    let err = connect_async(server.device_url(DEVICE_KEY)).await.unwrap_err();
    assert_eq!(http_status(err), 503);
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn settings_updates_reach_devices_in_order() {
    let server = TestServer::start().await;
    let (mut device, _) = server.connect_device().await;
    let (mut frontend, _) = server.connect_frontend().await;
    let notifier = Notifier::new(server.hub.clone());

    notifier.settings_updated(json!({ "seq": 1 }));
    notifier.settings_updated(json!({ "seq": 2 }));

    let first = recv_json(&mut device).await;
    let second = recv_json(&mut device).await;
    assert_eq!(first["type"], "settings_update");
    assert_eq!(first["data"]["seq"], 1);
    assert_eq!(second["data"]["seq"], 2);
    assert_eq!(first["target"], "device");

    assert_silent(&mut frontend, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn ping_gets_pong() {
    let server = TestServer::start().await;
    let (mut device, _) = server.connect_device().await;

    send_json(&mut device, json!({ "type": "ping" })).await;
    let pong = recv_json(&mut device).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["data"]["timestamp"].as_i64().is_some());
}

#[tokio::test]
async fn malformed_frames_do_not_close_connection() {
    let server = TestServer::start().await;
    let (mut device, _) = server.connect_device().await;

    device.send(Message::text("not json")).await.unwrap();
    send_json(&mut device, json!({ "data": {} })).await;
    send_json(&mut device, json!({ "type": "x", "target": "toaster" })).await;
    send_json(&mut device, json!({ "type": "ping" })).await;

    assert_eq!(recv_json(&mut device).await["type"], "pong");
    assert_eq!(server.hub.total_count().await, 1);
}

#[tokio::test]
async fn relayed_message_is_tagged_with_sender() {
    let server = TestServer::start().await;
    let (mut device, _) = server.connect_device().await;
    let (mut frontend, ack) = server.connect_frontend().await;
    let frontend_id = ack["data"]["client_id"].as_str().unwrap().to_string();

    send_json(
        &mut frontend,
        json!({ "type": "open_door", "data": { "door": 1 }, "target": "device" }),
    )
    .await;

    let relayed = recv_json(&mut device).await;
    assert_eq!(relayed["type"], "open_door");
    assert_eq!(relayed["data"]["door"], 1);
    assert_eq!(relayed["client_id"], frontend_id.as_str());

    // Targeted at devices, so the sender is not included.
    assert_silent(&mut frontend, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn untargeted_message_reaches_everyone_including_sender() {
    let server = TestServer::start().await;
    let (mut device, _) = server.connect_device().await;
    let (mut frontend, _) = server.connect_frontend().await;

    send_json(&mut device, json!({ "type": "visitor", "data": {} })).await;

    assert_eq!(recv_json(&mut frontend).await["type"], "visitor");
    assert_eq!(recv_json(&mut device).await["type"], "visitor");
}

#[tokio::test]
async fn health_reports_counts() {
    let server = TestServer::start().await;
    let (_d1, _) = server.connect_device().await;
    let (_d2, _) = server.connect_device().await;
    let (_f1, _) = server.connect_frontend().await;

    let health = server.health().await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["clients"], 3);
    assert_eq!(health["devices"], 2);
    assert_eq!(health["frontends"], 1);
    assert!(health["timestamp"].as_i64().is_some());
}

#[tokio::test]
async fn disconnect_unregisters_client() {
    let server = TestServer::start().await;
    let (mut device, _) = server.connect_device().await;
    assert_eq!(server.hub.total_count().await, 1);

    device.close(None).await.unwrap();
    assert!(wait_for_count(&server.hub, 0).await);
}

// ─────────────────────────────────────────────────────────────────────────────
// Token expiry extension
// ─────────────────────────────────────────────────────────────────────────────

const SLOW_TOKEN: &str = "slow-session-token";

/// How many extensions began, ran to completion, or were dropped midway.
#[derive(Clone, Default)]
struct ExtensionCounts {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
}

impl ExtensionCounts {
    fn get(&self) -> (usize, usize, usize) {
        (
            self.started.load(Ordering::SeqCst),
            self.finished.load(Ordering::SeqCst),
            self.cancelled.load(Ordering::SeqCst),
        )
    }
}

/// Counts as cancelled unless disarmed before drop.
struct InFlight {
    counts: ExtensionCounts,
    armed: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            self.counts.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Accepts [`SLOW_TOKEN`] and takes `delay` to extend it.
struct SlowVerifier {
    delay: Duration,
    counts: ExtensionCounts,
}

impl TokenVerifier for SlowVerifier {
    async fn validate(&self, token: &str) -> Result<Option<PublicUser>, AuthError> {
        Ok((token == SLOW_TOKEN).then(|| PublicUser {
            id: "user-slow".into(),
            username: "slow".into(),
            email: "slow@example.com".into(),
            role: ROLE_USER.into(),
        }))
    }

    async fn extend_expiry(&self, _token: &str) -> Result<(), AuthError> {
        self.counts.started.fetch_add(1, Ordering::SeqCst);
        let mut in_flight = InFlight {
            counts: self.counts.clone(),
            armed: true,
        };
        tokio::time::sleep(self.delay).await;
        in_flight.armed = false;
        self.counts.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn start_slow(
    delay: Duration,
    tweak: impl FnOnce(&mut TransportConfig),
) -> (TestServer, ExtensionCounts) {
    let counts = ExtensionCounts::default();
    let verifier = SlowVerifier {
        delay,
        counts: counts.clone(),
    };
    let server = TestServer::start_with_verifier(verifier, SLOW_TOKEN.to_string(), tweak).await;
    (server, counts)
}

async fn wait_until(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn token_extension_is_aborted_when_frontend_leaves() {
    let delay = Duration::from_millis(1500);
    let (server, counts) = start_slow(delay, |_| {}).await;

    let (mut frontend, ack) = server.connect_frontend().await;
    assert_eq!(ack["type"], "connected");
    assert_eq!(ack["data"]["user"]["username"], "slow");
    assert!(wait_until(|| counts.get().0 == 1).await);

    frontend.close(None).await.unwrap();
    assert!(wait_for_count(&server.hub, 0).await);
    assert!(wait_until(|| counts.get().2 == 1).await);

    // Outlive the verifier's delay: nothing completes late.
    tokio::time::sleep(delay + Duration::from_millis(300)).await;
    assert_eq!(counts.get(), (1, 0, 1));
}

#[tokio::test]
async fn slow_token_extension_times_out_without_closing_connection() {
    let (server, counts) = start_slow(Duration::from_secs(30), |config| {
        config.auth.token_extension_timeout = Duration::from_millis(200);
    })
    .await;

    let (mut frontend, _) = server.connect_frontend().await;
    assert!(wait_until(|| counts.get().2 == 1).await);
    assert_eq!(counts.get(), (1, 0, 1));

    // The session itself is unaffected.
    assert_eq!(server.hub.count_by_role(Role::Frontend).await, 1);
    send_json(&mut frontend, json!({ "type": "ping" })).await;
    assert_eq!(recv_json(&mut frontend).await["type"], "pong");
}

#[tokio::test]
async fn devices_never_extend_tokens() {
    let (server, counts) = start_slow(Duration::from_millis(10), |_| {}).await;
    let (_device, ack) = server.connect_device().await;
    assert_eq!(ack["data"]["is_device"], true);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counts.get(), (0, 0, 0));
}

// ─────────────────────────────────────────────────────────────────────────────
// Keepalive and shutdown
// ─────────────────────────────────────────────────────────────────────────────

fn short_keepalive(config: &mut TransportConfig) {
    config.keepalive = KeepaliveConfig {
        pong_wait: Duration::from_millis(800),
        ping_period: Duration::from_millis(300),
        write_wait: Duration::from_secs(1),
    };
}

#[tokio::test]
async fn responsive_client_survives_past_pong_wait() {
    let server = TestServer::start_with(short_keepalive).await;
    let (mut device, _) = server.connect_device().await;

    // Reading keeps answering server pings.
    assert_silent(&mut device, Duration::from_millis(2000)).await;
    assert_eq!(server.hub.total_count().await, 1);
}

#[tokio::test]
async fn silent_client_is_evicted() {
    let server = TestServer::start_with(short_keepalive).await;
    let (_device, _) = server.connect_device().await;
    assert_eq!(server.hub.total_count().await, 1);

    // Never polled, so pings go unanswered.
    assert!(wait_for_count(&server.hub, 0).await);
}

#[tokio::test]
async fn stop_closes_connected_clients() {
    let mut server = TestServer::start().await;
    let (mut device, _) = server.connect_device().await;

    server.transport.stop().await;

    let closed = timeout(WAIT, async {
        loop {
            match device.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(matches!(closed, Ok(true)));
    assert!(server.hub.is_closed());
}
