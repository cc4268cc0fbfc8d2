use async_trait::async_trait;

use crate::{
    Result,
    types::{CommandUsage, ConversationRecord, RateWindow, WindowOutcome},
};

/// Append-only conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a message. Saving the same `message_id` twice is a no-op.
    async fn save(&self, record: &ConversationRecord) -> Result<()>;

    /// Most recent messages of a conversation, newest first.
    async fn recent(&self, conversation_id: &str, limit: u32) -> Result<Vec<ConversationRecord>>;
}

/// Durable copy of the per-conversation rate windows.
#[async_trait]
pub trait RateWindowStore: Send + Sync {
    /// Atomically apply [`RateWindow::consume`] to the stored window.
    async fn consume(
        &self,
        conversation_id: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome>;

    async fn load(&self, conversation_id: &str) -> Result<Option<RateWindow>>;

    async fn clear(&self, conversation_id: &str) -> Result<()>;

    /// Delete every window whose reset time has passed. Returns the number
    /// of rows removed.
    async fn purge_expired(&self, now_ms: u64) -> Result<u64>;
}

/// Command invocation counters.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Increment and return the new count.
    async fn record_use(&self, command: &str, at_ms: u64) -> Result<u64>;

    /// All counters, most used first.
    async fn usage(&self) -> Result<Vec<CommandUsage>>;
}

/// Everything the gateway persists, plus a liveness check for `/health`.
#[async_trait]
pub trait Store: ConversationStore + RateWindowStore + UsageStore {
    async fn ping(&self) -> Result<()>;
}
