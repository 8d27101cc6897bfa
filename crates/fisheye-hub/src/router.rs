//! Per-client delivery: target matching plus a non-blocking enqueue.

use fisheye_protocol::{Message, Role};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Outcome of offering one message to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued on the client's outbound queue.
    Delivered,
    /// The client's role is outside the message's target.
    Skipped,
    /// The outbound queue is full; the consumer is too slow.
    Overflow,
    /// The receiving half is gone; the client's writer already exited.
    Closed,
}

impl Delivery {
    /// Whether the client should be evicted from the registry.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Overflow | Self::Closed)
    }
}

/// Never blocks: the hub must not wait on any single client.
pub fn try_enqueue(sender: &mpsc::Sender<Message>, message: Message) -> Delivery {
    match sender.try_send(message) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Full(_)) => Delivery::Overflow,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Route `message` to a client of `role`, honoring the message's target.
pub fn deliver(role: Role, sender: &mpsc::Sender<Message>, message: &Message) -> Delivery {
    if !message.is_for(role) {
        return Delivery::Skipped;
    }
    try_enqueue(sender, message.clone())
}
