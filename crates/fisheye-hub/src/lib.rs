//! Fisheye Hub — the process-wide registry of realtime clients.
//!
//! One control task owns the registry and serially processes registration,
//! unregistration and dispatch. Everything else talks to it through a cheap,
//! cloneable [`HubHandle`].

pub mod registry;
pub mod router;

pub use registry::{ClientRegistration, Hub, HubConfig, HubHandle};
pub use router::Delivery;

/// Capacity of each client's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
