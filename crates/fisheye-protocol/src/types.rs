//! Message type name constants.
//!
//! The `type` field is open-ended: applications may send any string and the
//! hub relays it untouched. These are the kinds the hub or the doorbell
//! backend produce themselves.

/// All well-known message type names.
pub struct MessageTypes;

impl MessageTypes {
    // ── Keepalive ───────────────────────────────────────────────────────
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    // ── Connection lifecycle ────────────────────────────────────────────
    pub const CONNECTED: &str = "connected";

    // ── Doorbell state ──────────────────────────────────────────────────
    pub const SETTINGS_UPDATE: &str = "settings_update";
    pub const SCHEDULE_UPDATE: &str = "schedule_update";

    // ── Relay ───────────────────────────────────────────────────────────
    pub const BROADCAST: &str = "broadcast";
}
