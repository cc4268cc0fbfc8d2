use {
    parley_common::InboundEvent,
    serde::{Deserialize, Serialize},
};

/// One persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub body: String,
    pub from_me: bool,
    pub is_group: bool,
    pub has_media: bool,
    pub timestamp_ms: u64,
}

impl From<&InboundEvent> for ConversationRecord {
    fn from(ev: &InboundEvent) -> Self {
        Self {
            message_id: ev.message_id.clone(),
            conversation_id: ev.conversation_id.clone(),
            sender_id: ev.sender_id.clone(),
            sender_name: ev.sender_name.clone(),
            body: ev.body.clone(),
            from_me: ev.from_me,
            is_group: ev.is_group,
            has_media: ev.has_media,
            timestamp_ms: ev.timestamp_ms,
        }
    }
}

/// Fixed-window counter for one conversation.
///
/// `count` saturates at `max + 1`: that value means "exhausted, and at least
/// one request was turned away".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    pub reset_at_ms: u64,
}

/// Result of consuming one unit from a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub window: RateWindow,
    pub accepted: bool,
}

impl RateWindow {
    pub fn fresh(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            reset_at_ms: now_ms.saturating_add(window_ms),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }

    /// Whether a further request would be rejected at `now_ms`.
    #[must_use]
    pub fn is_exhausted(&self, now_ms: u64, max_requests: u32) -> bool {
        !self.is_expired(now_ms) && self.count >= max_requests
    }

    #[must_use]
    pub fn remaining(&self, max_requests: u32) -> u32 {
        max_requests.saturating_sub(self.count)
    }

    #[must_use]
    pub fn ms_until_reset(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms)
    }

    /// Consume one request from `current`, lazily resetting an expired
    /// window. Every store implementation must agree with this function.
    pub fn consume(
        current: Option<Self>,
        now_ms: u64,
        window_ms: u64,
        max_requests: u32,
    ) -> WindowOutcome {
        let window = match current {
            Some(w) if !w.is_expired(now_ms) => Self {
                count: if w.count <= max_requests {
                    w.count + 1
                } else {
                    w.count
                },
                reset_at_ms: w.reset_at_ms,
            },
            _ => Self::fresh(now_ms, window_ms),
        };
        WindowOutcome {
            window,
            accepted: window.count <= max_requests,
        }
    }
}

/// Invocation counter for a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandUsage {
    pub command: String,
    pub count: u64,
    pub last_used_at_ms: u64,
}
