//! One realtime connection: identity, outbound queue and the two pumps.
//!
//! ```text
//! Connecting ──register──▶ Registered ──pumps started──▶ Active
//!                                                          │ read error, write error,
//!                                                          ▼ queue closed by the hub
//!                             Closed ◀──unregistered── Closing
//! ```
//!
//! The hub holds the only strong sender of the outbound queue. The client
//! keeps a weak one for self-replies (pong, connect ack), so unregistering
//! is what closes the queue, and it can only happen once.

use std::time::{Duration, Instant};

use axum::extract::ws::WebSocket;
use fisheye_hub::{ClientRegistration, HubHandle};
use fisheye_protocol::{ClientId, Message, MessageKind, PublicUser, Role};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::KeepaliveConfig;
use crate::conn::{self, ConnError, ConnReader, ConnWriter};

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Authenticated, not yet known to the hub.
    Connecting,
    /// In the registry, pumps not yet running.
    Registered,
    /// Both pumps running; participates in routing.
    Active,
    /// A pump hit a terminal condition; tearing down.
    Closing,
    /// Unregistered, socket and tasks released.
    Closed,
}

/// How the active phase ended.
enum Ending {
    Reader(ConnError),
    Writer,
}

/// A connected device or frontend session.
pub struct Client {
    id: ClientId,
    role: Role,
    user: Option<PublicUser>,
    connected_at: Instant,
    /// Current lifecycle state; observers subscribe through [`Client::watch_state`].
    state: watch::Sender<ClientState>,
    keepalive: KeepaliveConfig,
    /// Holds the strong sender until it is handed to the hub.
    registration: Option<ClientRegistration>,
    self_sender: mpsc::WeakSender<Message>,
    outbound: Option<mpsc::Receiver<Message>>,
    /// Connection-scoped background work, aborted at teardown.
    background: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn new(
        role: Role,
        user: Option<PublicUser>,
        queue_capacity: usize,
        keepalive: KeepaliveConfig,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            self_sender: tx.downgrade(),
            registration: Some(ClientRegistration::new(id.clone(), role, tx)),
            id,
            role,
            user,
            connected_at: Instant::now(),
            state: watch::Sender::new(ClientState::Connecting),
            keepalive,
            outbound: Some(rx),
            background: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Follow this client's lifecycle. The receiver keeps the last state
    /// (`Closed`) after [`Client::run`] has returned.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Put a message on this client's own queue without going through the
    /// hub. Returns `false` if the queue is full or already closed.
    pub fn enqueue_self(&self, message: Message) -> bool {
        match self.self_sender.upgrade() {
            Some(sender) => sender.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Tie a background task to this connection's lifetime.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.background.push(task);
    }

    fn transition(&mut self, next: ClientState) {
        let previous = self.state.send_replace(next);
        debug!("Client {} {:?} -> {:?}", self.id, previous, next);
    }

    async fn register(&mut self, hub: &HubHandle) {
        if let Some(registration) = self.registration.take() {
            hub.register(registration).await;
            self.transition(ClientState::Registered);
        }
    }

    /// Register with the hub (if not done yet), run both pumps until one of
    /// them stops, then tear down. Returns once every resource of the
    /// connection has been released.
    pub async fn run(mut self, socket: WebSocket, hub: HubHandle) {
        self.register(&hub).await;

        let (mut reader, writer) = conn::split(socket, &self.keepalive);
        let Some(outbound) = self.outbound.take() else {
            error!("Client {} started twice", self.id);
            return;
        };
        let mut writer_task = tokio::spawn(write_pump(
            self.id.clone(),
            writer,
            outbound,
            self.keepalive.ping_period,
        ));
        self.transition(ClientState::Active);

        let mut writer_done = false;
        let ending = tokio::select! {
            err = self.read_pump(&mut reader, &hub) => Ending::Reader(err),
            _ = &mut writer_task => {
                writer_done = true;
                Ending::Writer
            }
        };
        drop(reader);

        self.transition(ClientState::Closing);
        match &ending {
            Ending::Reader(err) if err.is_normal_close() => {
                debug!("Client {} read loop ended: {err}", self.id);
            }
            Ending::Reader(err) => warn!("Read error for client {}: {err}", self.id),
            Ending::Writer => debug!("Client {} write loop ended", self.id),
        }

        hub.unregister(self.id.clone()).await;

        // The writer sees the closed queue, sends a close frame and exits.
        if !writer_done
            && tokio::time::timeout(self.keepalive.write_wait, &mut writer_task)
                .await
                .is_err()
        {
            debug!("Client {} writer did not stop in time, aborting", self.id);
            writer_task.abort();
        }
        for task in self.background.drain(..) {
            task.abort();
        }

        self.transition(ClientState::Closed);
        match &self.user {
            Some(user) => info!(
                "Client disconnected: {} ({}, user {}, connected for {:?})",
                self.id,
                self.role,
                user.username,
                self.connected_for()
            ),
            None => info!(
                "Client disconnected: {} ({}, connected for {:?})",
                self.id,
                self.role,
                self.connected_for()
            ),
        }
    }

    async fn read_pump(&self, reader: &mut ConnReader, hub: &HubHandle) -> ConnError {
        loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(err) => return err,
            };
            let mut message = match Message::from_slice(&frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!("Invalid message format from client {}: {err}", self.id);
                    continue;
                }
            };
            message.origin_client_id = Some(self.id.clone());
            self.handle_message(message, hub);
        }
    }

    fn handle_message(&self, message: Message, hub: &HubHandle) {
        debug!(
            "Message received from {}: type={}",
            self.id, message.message_type
        );
        match message.kind() {
            MessageKind::Ping => {
                if !self.enqueue_self(Message::pong()) {
                    debug!("Pong for client {} dropped, queue unavailable", self.id);
                }
            }
            MessageKind::Pong | MessageKind::Connected | MessageKind::Generic(_) => {
                hub.dispatch(message);
            }
        }
    }
}

async fn write_pump(
    client_id: ClientId,
    writer: ConnWriter,
    outbound: mpsc::Receiver<Message>,
    ping_period: Duration,
) {
    match pump_outbound(&client_id, writer, outbound, ping_period).await {
        Ok(()) => debug!("Client {client_id} outbound queue closed"),
        Err(err) if err.is_normal_close() => debug!("Write loop for {client_id} ended: {err}"),
        Err(err) => warn!("Write error for client {client_id}: {err}"),
    }
}

async fn pump_outbound(
    client_id: &str,
    mut writer: ConnWriter,
    mut outbound: mpsc::Receiver<Message>,
    ping_period: Duration,
) -> Result<(), ConnError> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    return writer.write_close().await;
                };
                match message.to_json() {
                    Ok(text) => writer.write_text(text).await?,
                    Err(err) => error!("Failed to encode message for {client_id}: {err}"),
                }
            }
            _ = ticker.tick() => writer.write_ping().await?,
        }
    }
}
