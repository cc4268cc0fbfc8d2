//! Values that flow between the session, the pipeline and command handlers.

use std::time::{SystemTime, UNIX_EPOCH};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::Result;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single inbound chat message, as delivered by the chat network.
///
/// Built once by the transport and then shared read-only (behind an `Arc`)
/// by every pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub body: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub has_media: bool,
    /// Sent by the account this session is logged in as.
    #[serde(default)]
    pub from_me: bool,
    pub timestamp_ms: u64,
}

impl InboundEvent {
    /// A direct text message stamped with the current time.
    pub fn text(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            sender_name: None,
            body: body.into(),
            is_group: false,
            has_media: false,
            from_me: false,
            timestamp_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    #[must_use]
    pub fn in_group(mut self) -> Self {
        self.is_group = true;
        self
    }

    #[must_use]
    pub fn from_self(mut self) -> Self {
        self.from_me = true;
        self
    }
}

/// Acknowledgement returned by the chat network for an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub conversation_id: String,
    pub sent_at_ms: u64,
}

/// Narrow send capability handed to middlewares, commands and plugins.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt>;
}
