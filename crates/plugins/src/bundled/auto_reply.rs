//! `auto-reply` plugin: canned answers for configured keywords.

use std::sync::Arc;

use {
    async_trait::async_trait,
    parley_config::AutoReplyRule,
    parley_pipeline::{MessageContext, Middleware, Next},
    tracing::{debug, warn},
};

use crate::plugin::{Plugin, PluginContext};

pub struct AutoReplyPlugin {
    middleware: Arc<AutoReply>,
}

impl AutoReplyPlugin {
    pub fn new(rules: Vec<AutoReplyRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|r| !r.keyword.trim().is_empty())
            .map(|r| CompiledRule {
                keyword: r.keyword.trim().to_lowercase(),
                reply: r.reply,
                direct_only: r.direct_only,
            })
            .collect();
        Self {
            middleware: Arc::new(AutoReply { rules }),
        }
    }
}

#[async_trait]
impl Plugin for AutoReplyPlugin {
    fn name(&self) -> &str {
        "auto-reply"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn init(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        debug!(rules = self.middleware.rules.len(), "auto-reply rules loaded");
        Ok(())
    }

    fn middleware(&self) -> Option<Arc<dyn Middleware>> {
        Some(Arc::clone(&self.middleware) as Arc<dyn Middleware>)
    }
}

struct CompiledRule {
    keyword: String,
    reply: String,
    direct_only: bool,
}

struct AutoReply {
    rules: Vec<CompiledRule>,
}

impl AutoReply {
    fn matching(&self, body: &str, is_group: bool) -> Option<&CompiledRule> {
        let body = body.to_lowercase();
        self.rules
            .iter()
            .filter(|r| !(r.direct_only && is_group))
            .find(|r| body.contains(&r.keyword))
    }
}

#[async_trait]
impl Middleware for AutoReply {
    fn name(&self) -> &str {
        "auto-reply"
    }

    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
        if !ctx.handled && !ctx.is_command && !ctx.event.from_me {
            let reply = self
                .matching(&ctx.event.body, ctx.event.is_group)
                .map(|r| r.reply.clone());
            if let Some(reply) = reply {
                match ctx.reply(&reply).await {
                    Ok(_) => ctx.handled = true,
                    Err(e) => warn!(
                        conversation_id = %ctx.event.conversation_id,
                        error = %e,
                        "auto-reply send failed"
                    ),
                }
            }
        }
        next.run(ctx).await
    }
}
