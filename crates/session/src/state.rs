use serde::Serialize;

/// Lifecycle of the single chat-network session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    /// A pairing credential (QR) is shown and waiting to be scanned.
    AwaitingCredential,
    /// Scanned; waiting for the network to report ready.
    Authenticating,
    Connected,
    Reconnecting,
    /// Reconnection gave up. Only `initialize()` leaves this state.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::AwaitingCredential => "awaiting_credential",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Read-only view of the session for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub attempt: u32,
    pub last_credential_at_ms: Option<u64>,
    pub connected_since_ms: Option<u64>,
    pub account: Option<String>,
}
