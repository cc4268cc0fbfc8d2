//! In-process store used by tests and when no database is configured.

use std::{
    collections::HashSet,
    sync::Mutex,
};

use {async_trait::async_trait, dashmap::DashMap};

use crate::{
    Result,
    traits::{ConversationStore, RateWindowStore, Store, UsageStore},
    types::{CommandUsage, ConversationRecord, RateWindow, WindowOutcome},
};

#[derive(Default)]
struct History {
    seen: HashSet<String>,
    records: Vec<ConversationRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    history: Mutex<History>,
    windows: DashMap<String, RateWindow>,
    usage: DashMap<String, CommandUsage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.seen.insert(record.message_id.clone()) {
            history.records.push(record.clone());
        }
        Ok(())
    }

    async fn recent(&self, conversation_id: &str, limit: u32) -> Result<Vec<ConversationRecord>> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<_> = history
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.conversation_id == conversation_id)
            .collect();
        // Newest first, insertion order breaks timestamp ties.
        rows.sort_by(|(ia, a), (ib, b)| b.timestamp_ms.cmp(&a.timestamp_ms).then(ib.cmp(ia)));
        Ok(rows
            .into_iter()
            .take(limit as usize)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[async_trait]
impl RateWindowStore for MemoryStore {
    async fn consume(
        &self,
        conversation_id: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome> {
        let mut entry = self
            .windows
            .entry(conversation_id.to_string())
            .or_insert(RateWindow {
                count: 0,
                reset_at_ms: 0,
            });
        let outcome = RateWindow::consume(Some(*entry), now_ms, window_ms, max_requests);
        *entry = outcome.window;
        Ok(outcome)
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<RateWindow>> {
        Ok(self.windows.get(conversation_id).map(|w| *w))
    }

    async fn clear(&self, conversation_id: &str) -> Result<()> {
        self.windows.remove(conversation_id);
        Ok(())
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<u64> {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.reset_at_ms > now_ms);
        Ok((before - self.windows.len()) as u64)
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_use(&self, command: &str, at_ms: u64) -> Result<u64> {
        let mut entry = self
            .usage
            .entry(command.to_string())
            .or_insert_with(|| CommandUsage {
                command: command.to_string(),
                count: 0,
                last_used_at_ms: at_ms,
            });
        entry.count += 1;
        entry.last_used_at_ms = at_ms;
        Ok(entry.count)
    }

    async fn usage(&self) -> Result<Vec<CommandUsage>> {
        let mut all: Vec<_> = self.usage.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.command.cmp(&b.command)));
        Ok(all)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_messages_are_ignored() {
        let store = MemoryStore::new();
        let mut rec = ConversationRecord {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "bob".into(),
            sender_name: None,
            body: "hi".into(),
            from_me: false,
            is_group: false,
            has_media: false,
            timestamp_ms: 5,
        };
        store.save(&rec).await.unwrap();
        store.save(&rec).await.unwrap();
        rec.message_id = "m2".into();
        store.save(&rec).await.unwrap();

        let rows = store.recent("c1", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message_id, "m2");
        assert_eq!(store.recent("c1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn consume_saturates_and_purges() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.consume("c1", 100, 1_000, 2).await.unwrap();
        }
        let out = store.consume("c1", 200, 1_000, 2).await.unwrap();
        assert!(!out.accepted);
        assert_eq!(out.window.count, 3);

        assert_eq!(store.purge_expired(1_099).await.unwrap(), 0);
        assert_eq!(store.purge_expired(1_100).await.unwrap(), 1);
        assert!(store.load("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_is_sorted_by_count() {
        let store = MemoryStore::new();
        store.record_use("help", 1).await.unwrap();
        store.record_use("ping", 2).await.unwrap();
        store.record_use("ping", 3).await.unwrap();
        let usage = store.usage().await.unwrap();
        assert_eq!(usage[0].command, "ping");
        assert_eq!(usage[0].count, 2);
        assert_eq!(usage[1].command, "help");
    }
}
