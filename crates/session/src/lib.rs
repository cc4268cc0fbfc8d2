//! Chat-network session lifecycle: pairing, connection health, and
//! reconnection with capped exponential backoff.

pub mod backoff;
pub mod event;
pub mod manager;
pub mod sidecar;
pub mod state;
pub mod transport;

pub use {
    event::SessionEvent,
    manager::SessionManager,
    sidecar::{SidecarEvent, SidecarRequest, SidecarTransport},
    state::{SessionSnapshot, SessionState},
    transport::{ChatTransport, DisconnectReason, TransportEvent},
};
