//! Typed pushes from the REST side of the backend to connected clients.

use chrono::{DateTime, Utc};
use fisheye_hub::HubHandle;
use fisheye_protocol::{Message, MessageTypes, Role};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};

#[derive(Clone)]
pub struct Notifier {
    hub: HubHandle,
}

impl Notifier {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }

    /// Doorbell settings changed; devices reload them.
    pub fn settings_updated(&self, settings: Value) {
        self.hub.broadcast_to_role(
            Role::Device,
            Message::new(MessageTypes::SETTINGS_UPDATE, settings),
        );
        info!("Broadcasted settings update to devices");
    }

    /// Calendar synced; devices receive the new schedule.
    pub fn schedule_updated<E: Serialize>(&self, events: &[E], last_sync: DateTime<Utc>) {
        let events = match serde_json::to_value(events) {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to encode schedule: {e}");
                return;
            }
        };
        self.hub.broadcast_to_role(
            Role::Device,
            Message::new(
                MessageTypes::SCHEDULE_UPDATE,
                json!({ "events": events, "last_sync": last_sync }),
            ),
        );
        info!("Broadcasted schedule update to devices");
    }

    /// Arbitrary event for dashboards (visits, voice messages, ...).
    pub fn notify_frontends(&self, message_type: &str, data: Value) {
        self.hub
            .broadcast_to_role(Role::Frontend, Message::new(message_type, data));
    }

    /// Number of doorbells currently online.
    pub async fn connected_devices(&self) -> usize {
        self.hub.count_by_role(Role::Device).await
    }
}
