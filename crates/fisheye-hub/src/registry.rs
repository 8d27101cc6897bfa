//! The hub control loop and its handle.
//!
//! The registry map lives inside [`Hub`] and is only ever touched by the
//! control task spawned in [`Hub::spawn`]. Callers go through [`HubHandle`],
//! which forwards every operation as a [`Command`] over a bounded channel, so
//! registration, unregistration and dispatch are linearized without a lock.

use std::collections::HashMap;

use fisheye_protocol::{ClientId, Message, Role};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::router::{self, Delivery};

/// Hub tuning knobs.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command intake. Dispatches arriving while it is full
    /// are dropped.
    pub intake_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 1024,
        }
    }
}

/// What the hub needs to route to a client.
///
/// `sender` must be the only strong sender of the client's outbound queue:
/// when the hub drops it on unregistration the queue closes, which is the
/// writer's signal to send a close frame and exit.
#[derive(Debug)]
pub struct ClientRegistration {
    pub id: ClientId,
    pub role: Role,
    sender: mpsc::Sender<Message>,
}

impl ClientRegistration {
    pub fn new(id: impl Into<ClientId>, role: Role, sender: mpsc::Sender<Message>) -> Self {
        Self {
            id: id.into(),
            role,
            sender,
        }
    }
}

enum Command {
    Register(ClientRegistration),
    Unregister(ClientId),
    Dispatch(Message),
    SendTo {
        client_id: ClientId,
        message: Message,
        reply: oneshot::Sender<bool>,
    },
    Count {
        role: Option<Role>,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Entry {
    role: Role,
    sender: mpsc::Sender<Message>,
}

/// The registry itself. Owned by the control task.
pub struct Hub {
    clients: HashMap<ClientId, Entry>,
}

impl Hub {
    /// Start the control task and return a handle to it.
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (tx, rx) = mpsc::channel(config.intake_capacity.max(1));
        let hub = Hub {
            clients: HashMap::new(),
        };
        tokio::spawn(hub.run(rx));
        HubHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("Hub control loop started");
        let mut shutdown_reply = None;
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register(registration) => self.register(registration),
                Command::Unregister(client_id) => {
                    self.unregister(&client_id);
                }
                Command::Dispatch(message) => self.dispatch(&message),
                Command::SendTo {
                    client_id,
                    message,
                    reply,
                } => {
                    let _ = reply.send(self.send_to(&client_id, message));
                }
                Command::Count { role, reply } => {
                    let _ = reply.send(self.count(role));
                }
                Command::Shutdown { reply } => {
                    self.drain();
                    shutdown_reply = Some(reply);
                    break;
                }
            }
        }
        // Close the intake before acknowledging shutdown so that the caller
        // observes a stopped hub.
        drop(rx);
        debug!("Hub control loop stopped ({} clients dropped)", self.clients.len());
        self.clients.clear();
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn register(&mut self, registration: ClientRegistration) {
        let ClientRegistration { id, role, sender } = registration;
        if self.clients.insert(id.clone(), Entry { role, sender }).is_some() {
            warn!("Client {id} registered twice, previous queue closed");
        }
        info!("Client registered: {id} ({role}, total: {})", self.clients.len());
    }

    /// Removing the entry drops the hub's sender, closing the client's queue.
    fn unregister(&mut self, client_id: &str) -> bool {
        match self.clients.remove(client_id) {
            Some(_) => {
                info!("Client unregistered: {client_id} (total: {})", self.clients.len());
                true
            }
            None => false,
        }
    }

    fn dispatch(&mut self, message: &Message) {
        let mut evicted = Vec::new();
        for (id, entry) in &self.clients {
            let delivery = router::deliver(entry.role, &entry.sender, message);
            if !delivery.is_unhealthy() {
                continue;
            }
            if delivery == Delivery::Overflow {
                warn!("Client {id} send buffer full, disconnecting");
            } else {
                debug!("Client {id} queue already closed, removing");
            }
            evicted.push(id.clone());
        }
        for id in evicted {
            self.unregister(&id);
        }
    }

    fn send_to(&self, client_id: &str, message: Message) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|entry| router::try_enqueue(&entry.sender, message) == Delivery::Delivered)
    }

    fn count(&self, role: Option<Role>) -> usize {
        match role {
            Some(role) => self.clients.values().filter(|e| e.role == role).count(),
            None => self.clients.len(),
        }
    }

    fn drain(&mut self) {
        if !self.clients.is_empty() {
            info!("Hub shutting down, disconnecting {} clients", self.clients.len());
        }
        self.clients.clear();
    }
}

/// Cheap, cloneable handle to the hub control task.
///
/// Every method is a no-op (returning `false` / `0`) once the hub has shut
/// down.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
}

impl HubHandle {
    /// Add a client to the registry.
    pub async fn register(&self, registration: ClientRegistration) {
        let _ = self.tx.send(Command::Register(registration)).await;
    }

    /// Remove a client. Unknown or already removed ids are ignored.
    pub async fn unregister(&self, client_id: impl Into<ClientId>) {
        let _ = self.tx.send(Command::Unregister(client_id.into())).await;
    }

    /// Route a message to every client inside its target.
    ///
    /// Never blocks. If the hub's intake is saturated the message is dropped.
    pub fn dispatch(&self, message: Message) {
        match self.tx.try_send(Command::Dispatch(message)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Hub intake full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Hub stopped, message dropped");
            }
        }
    }

    /// Dispatch to every client of one role.
    pub fn broadcast_to_role(&self, role: Role, message: Message) {
        self.dispatch(message.with_target(role));
    }

    /// Enqueue a message for a single client. Returns `false` if the client
    /// is unknown or its queue is full.
    pub async fn send_to_client(&self, client_id: &str, message: Message) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::SendTo {
            client_id: client_id.to_string(),
            message,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn count_by_role(&self, role: Role) -> usize {
        self.count(Some(role)).await
    }

    pub async fn total_count(&self) -> usize {
        self.count(None).await
    }

    async fn count(&self, role: Option<Role>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Count { role, reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Disconnect every client and stop the control task.
    ///
    /// Closing the queues makes each writer send a close frame; the readers
    /// then tear down and their own unregister calls become no-ops.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the control task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
