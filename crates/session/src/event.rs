use std::sync::Arc;

use parley_common::InboundEvent;

/// Everything the session manager reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    CredentialIssued { credential: String },
    Authenticated,
    Connected { account: Option<String> },
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    HealthCheckFailed { error: String },
    /// Terminal. Emitted exactly once per transition into `Failed`.
    ReconnectExhausted { attempts: u32 },
    Message(Arc<InboundEvent>),
}

impl SessionEvent {
    /// Short dotted name used for logs and webhook broadcasts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CredentialIssued { .. } => "session.credential_issued",
            Self::Authenticated => "session.authenticated",
            Self::Connected { .. } => "session.connected",
            Self::Disconnected { .. } => "session.disconnected",
            Self::Reconnecting { .. } => "session.reconnecting",
            Self::HealthCheckFailed { .. } => "session.health_check_failed",
            Self::ReconnectExhausted { .. } => "session.reconnect_exhausted",
            Self::Message(_) => "session.message",
        }
    }
}
