use std::{future::Future, sync::Arc};

use {
    async_trait::async_trait,
    parley_common::{DeliveryReceipt, InboundEvent, Outbound},
    serde::Serialize,
};

/// Everything a handler gets to work with for one invocation.
#[derive(Clone)]
pub struct CommandContext {
    pub event: Arc<InboundEvent>,
    /// Canonical command name, even when invoked through an alias.
    pub command: String,
    /// The token the user actually typed, lowercased.
    pub invoked_as: String,
    pub args: Vec<String>,
    pub outbound: Arc<dyn Outbound>,
}

impl CommandContext {
    /// Send `text` back to the conversation the command came from.
    pub async fn reply(&self, text: &str) -> parley_common::Result<DeliveryReceipt> {
        self.outbound
            .send_text(&self.event.conversation_id, text)
            .await
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, ctx: CommandContext) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: CommandContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`CommandHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A command definition, built with chained setters and handed to
/// [`crate::Dispatcher::register`].
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    /// Per-conversation cooldown. `0` disables it.
    pub cooldown_ms: u64,
    pub category: String,
    pub description: String,
    pub usage: String,
    pub handler: Option<Arc<dyn CommandHandler>>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            cooldown_ms: 0,
            category: "general".into(),
            description: String::new(),
            usage: String::new(),
            handler: None,
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    #[must_use]
    pub fn cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = ms;
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn handler_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler(handler_fn(f))
    }
}

/// Public view of a registered command, used by `help` and `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSummary {
    pub name: String,
    /// Aliases that were actually claimed at registration.
    pub aliases: Vec<String>,
    pub category: String,
    pub description: String,
    pub usage: String,
    pub cooldown_ms: u64,
}
