//! Ordered middleware chain that every inbound message passes through.
//!
//! Each [`Middleware`] receives the mutable [`MessageContext`] and a [`Next`]
//! continuation. It can work before or after calling `next.run(ctx)`, or
//! skip the call to stop the chain.

use std::sync::{Arc, RwLock};

use {
    async_trait::async_trait,
    parley_common::{Error, InboundEvent, Outbound, Result},
    parley_ratelimit::RateDecision,
    tracing::{debug, info},
};

/// Per-message state shared by all stages.
pub struct MessageContext {
    pub event: Arc<InboundEvent>,
    pub outbound: Arc<dyn Outbound>,
    /// Body starts with the command prefix.
    pub is_command: bool,
    /// Set by a stage that fully answered the message.
    pub handled: bool,
    /// Filled in by the rate-limit gate.
    pub rate_limit: Option<RateDecision>,
}

impl MessageContext {
    pub fn new(event: Arc<InboundEvent>, outbound: Arc<dyn Outbound>, prefix: char) -> Self {
        let is_command = event.body.starts_with(prefix);
        Self {
            event,
            outbound,
            is_command,
            handled: false,
            rate_limit: None,
        }
    }

    pub async fn reply(&self, text: &str) -> Result<parley_common::DeliveryReceipt> {
        self.outbound
            .send_text(&self.event.conversation_id, text)
            .await
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unique name, used to detach the middleware later.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut MessageContext) -> anyhow::Result<()> {
        match self.rest.split_first() {
            Some((head, tail)) => head.handle(ctx, Next { rest: tail }).await,
            None => Ok(()),
        }
    }

    /// Number of stages still to run.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

#[derive(Default)]
pub struct Pipeline {
    stages: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. Names must be unique.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) -> Result<()> {
        let mut stages = self.stages.write().unwrap_or_else(|e| e.into_inner());
        if stages.iter().any(|m| m.name() == middleware.name()) {
            return Err(Error::validation(format!(
                "middleware {} is already registered",
                middleware.name()
            )));
        }
        info!(middleware = middleware.name(), position = stages.len(), "middleware added");
        stages.push(middleware);
        Ok(())
    }

    /// Detach a middleware by name. Returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        let mut stages = self.stages.write().unwrap_or_else(|e| e.into_inner());
        let before = stages.len();
        stages.retain(|m| m.name() != name);
        let removed = stages.len() != before;
        if removed {
            debug!(middleware = name, "middleware removed");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        self.stages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Run every stage in registration order.
    ///
    /// The chain is snapshotted first, so stages added or removed while a
    /// message is in flight only affect later messages.
    pub async fn run(&self, ctx: &mut MessageContext) -> anyhow::Result<()> {
        let snapshot: Vec<Arc<dyn Middleware>> = self
            .stages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Next { rest: &snapshot }.run(ctx).await
    }
}
