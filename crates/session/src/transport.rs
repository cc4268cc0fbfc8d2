use {
    async_trait::async_trait,
    parley_common::{DeliveryReceipt, InboundEvent, Result},
    tokio::sync::mpsc,
};

/// Why the chat network dropped the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Clean close initiated by the client side. Not retried.
    Navigation,
    LoggedOut,
    Other(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Navigation => f.write_str("navigation"),
            Self::LoggedOut => f.write_str("logged out"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A new pairing credential to show to the user.
    Credential(String),
    Authenticated,
    Ready { account: Option<String> },
    Message(InboundEvent),
    Disconnected(DisconnectReason),
}

/// Connection to the chat network.
///
/// Each successful `open` yields a fresh event stream. Closing the stream
/// without a `Disconnected` event is treated as an unexplained disconnect.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn close(&self) -> Result<()>;

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Ask for a new pairing credential while one is being displayed.
    async fn refresh_credential(&self) -> Result<()>;
}
