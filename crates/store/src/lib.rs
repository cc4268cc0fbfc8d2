//! Persistence for conversation history, rate windows and command usage.
//!
//! [`SqliteStore`] is the production backend; [`MemoryStore`] keeps the same
//! semantics in process.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use {
    error::{Error, Result},
    memory::MemoryStore,
    sqlite::SqliteStore,
    traits::{ConversationStore, RateWindowStore, Store, UsageStore},
    types::{CommandUsage, ConversationRecord, RateWindow, WindowOutcome},
};

/// Create the `conversation_messages`, `rate_windows` and `command_usage`
/// tables.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
