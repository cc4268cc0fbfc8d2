//! `command-logger` plugin: appends every command message to a JSONL file.

use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    parley_common::now_ms,
    parley_pipeline::{MessageContext, Middleware, Next},
    tracing::warn,
};

use crate::plugin::{Plugin, PluginContext};

pub struct CommandLoggerPlugin {
    middleware: Arc<CommandLogger>,
}

impl CommandLoggerPlugin {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            middleware: Arc::new(CommandLogger::new(log_path)),
        }
    }

    /// `<data_dir>/logs/commands.log`
    pub fn default_path() -> PathBuf {
        parley_config::data_dir().join("logs/commands.log")
    }
}

#[async_trait]
impl Plugin for CommandLoggerPlugin {
    fn name(&self) -> &str {
        "command-logger"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn init(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        // Fail at load time rather than on the first command.
        self.middleware.ensure_file()
    }

    fn middleware(&self) -> Option<Arc<dyn Middleware>> {
        Some(Arc::clone(&self.middleware) as Arc<dyn Middleware>)
    }
}

/// Runs after dispatch so the entry can record whether a handler answered.
struct CommandLogger {
    log_path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl CommandLogger {
    fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            file: Mutex::new(None),
        }
    }

    fn ensure_file(&self) -> anyhow::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            if let Some(parent) = self.log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            *guard = Some(file);
        }
        Ok(())
    }

    fn append(&self, entry: &serde_json::Value) {
        if let Err(e) = self.ensure_file() {
            warn!(error = %e, "command-logger: failed to open log file");
            return;
        }
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ref mut f) = *guard
            && let Err(e) = writeln!(f, "{entry}")
        {
            warn!(error = %e, "command-logger: failed to write log entry");
        }
    }
}

#[async_trait]
impl Middleware for CommandLogger {
    fn name(&self) -> &str {
        "command-logger"
    }

    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
        let result = next.run(ctx).await;
        if ctx.is_command {
            let ev = &ctx.event;
            self.append(&serde_json::json!({
                "ts": now_ms(),
                "conversation_id": ev.conversation_id,
                "sender_id": ev.sender_id,
                "message_id": ev.message_id,
                "body": ev.body,
                "handled": ctx.handled,
            }));
        }
        result
    }
}
