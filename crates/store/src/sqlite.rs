use {async_trait::async_trait, sqlx::SqlitePool, tracing::debug};

use crate::{
    Result,
    traits::{ConversationStore, RateWindowStore, Store, UsageStore},
    types::{CommandUsage, ConversationRecord, RateWindow, WindowOutcome},
};

/// SQLite-backed store shared by the session, rate limiter and dispatcher.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    message_id: String,
    conversation_id: String,
    sender_id: String,
    sender_name: Option<String>,
    body: String,
    from_me: bool,
    is_group: bool,
    has_media: bool,
    timestamp_ms: i64,
}

impl From<MessageRow> for ConversationRecord {
    fn from(r: MessageRow) -> Self {
        Self {
            message_id: r.message_id,
            conversation_id: r.conversation_id,
            sender_id: r.sender_id,
            sender_name: r.sender_name,
            body: r.body,
            from_me: r.from_me,
            is_group: r.is_group,
            has_media: r.has_media,
            timestamp_ms: r.timestamp_ms.max(0) as u64,
        }
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn window_from_row(count: i64, reset_at: i64) -> RateWindow {
    RateWindow {
        count: u32::try_from(count.max(0)).unwrap_or(u32::MAX),
        reset_at_ms: reset_at.max(0) as u64,
    }
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn open(url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(url).await?;
        crate::run_migrations(&pool).await?;
        debug!("store migrations applied");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO conversation_messages
             (message_id, conversation_id, sender_id, sender_name, body,
              from_me, is_group, has_media, timestamp_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.message_id)
        .bind(&record.conversation_id)
        .bind(&record.sender_id)
        .bind(&record.sender_name)
        .bind(&record.body)
        .bind(record.from_me)
        .bind(record.is_group)
        .bind(record.has_media)
        .bind(to_i64(record.timestamp_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, conversation_id: &str, limit: u32) -> Result<Vec<ConversationRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, conversation_id, sender_id, sender_name, body,
                    from_me, is_group, has_media, timestamp_ms
             FROM conversation_messages
             WHERE conversation_id = ?
             ORDER BY timestamp_ms DESC, id DESC
             LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl RateWindowStore for SqliteStore {
    async fn consume(
        &self,
        conversation_id: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome> {
        // Single statement so concurrent consumers never lose an update.
        // Column references inside DO UPDATE read the pre-update row.
        let (count, reset_at) = sqlx::query_as::<_, (i64, i64)>(
            "INSERT INTO rate_windows (conversation_id, count, reset_at)
             VALUES (?1, 1, ?2 + ?3)
             ON CONFLICT(conversation_id) DO UPDATE SET
                 count = CASE
                     WHEN ?2 >= reset_at THEN 1
                     WHEN count <= ?4 THEN count + 1
                     ELSE count
                 END,
                 reset_at = CASE
                     WHEN ?2 >= reset_at THEN ?2 + ?3
                     ELSE reset_at
                 END
             RETURNING count, reset_at",
        )
        .bind(conversation_id)
        .bind(to_i64(now_ms))
        .bind(to_i64(window_ms))
        .bind(i64::from(max_requests))
        .fetch_one(&self.pool)
        .await?;

        let window = window_from_row(count, reset_at);
        Ok(WindowOutcome {
            window,
            accepted: window.count <= max_requests,
        })
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<RateWindow>> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            "SELECT count, reset_at FROM rate_windows WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(count, reset_at)| window_from_row(count, reset_at)))
    }

    async fn clear(&self, conversation_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_windows WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<u64> {
        let done = sqlx::query("DELETE FROM rate_windows WHERE reset_at <= ?")
            .bind(to_i64(now_ms))
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn record_use(&self, command: &str, at_ms: u64) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "INSERT INTO command_usage (command, count, last_used_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(command) DO UPDATE SET
                 count = count + 1,
                 last_used_at = ?2
             RETURNING count",
        )
        .bind(command)
        .bind(to_i64(at_ms))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn usage(&self) -> Result<Vec<CommandUsage>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT command, count, last_used_at FROM command_usage
             ORDER BY count DESC, command ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(command, count, last)| CommandUsage {
                command,
                count: count.max(0) as u64,
                last_used_at_ms: last.max(0) as u64,
            })
            .collect())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
