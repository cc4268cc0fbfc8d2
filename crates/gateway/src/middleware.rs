//! The gateway's own pipeline stages, registered ahead of plugin stages.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Instant};

use {
    async_trait::async_trait,
    futures::FutureExt,
    parley_commands::Dispatcher,
    parley_pipeline::{MessageContext, Middleware, Next},
    parley_ratelimit::RateLimiter,
    tracing::{debug, error, info, warn},
};

use crate::state::GatewayStats;

pub const RATE_LIMIT_NOTICE: &str = "You're sending messages too quickly. Please wait a moment.";
pub const APOLOGY: &str = "Sorry, something went wrong while handling your message.";

/// Drops messages from conversations that exhausted their window.
pub struct RateGate {
    limiter: Arc<RateLimiter>,
    stats: Arc<GatewayStats>,
    notify: bool,
}

impl RateGate {
    pub fn new(limiter: Arc<RateLimiter>, stats: Arc<GatewayStats>, notify: bool) -> Self {
        Self {
            limiter,
            stats,
            notify,
        }
    }
}

#[async_trait]
impl Middleware for RateGate {
    fn name(&self) -> &str {
        "rate-limit"
    }

    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
        let decision = self
            .limiter
            .check_and_consume(&ctx.event.conversation_id)
            .await;
        ctx.rate_limit = Some(decision);
        if decision.allowed {
            return next.run(ctx).await;
        }

        self.stats.record_rejected();
        debug!(
            conversation_id = %ctx.event.conversation_id,
            ms_until_reset = decision.ms_until_reset,
            "message rate limited"
        );
        if self.notify
            && let Err(e) = ctx.reply(RATE_LIMIT_NOTICE).await
        {
            warn!(conversation_id = %ctx.event.conversation_id, error = %e, "failed to send rate-limit notice");
        }
        Ok(())
    }
}

/// One structured line per message, plus timing once the chain returns.
pub struct RequestLog;

#[async_trait]
impl Middleware for RequestLog {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
        let started = Instant::now();
        info!(
            conversation_id = %ctx.event.conversation_id,
            sender_id = %ctx.event.sender_id,
            message_id = %ctx.event.message_id,
            is_group = ctx.event.is_group,
            is_command = ctx.is_command,
            "inbound message"
        );
        let result = next.run(ctx).await;
        debug!(
            message_id = %ctx.event.message_id,
            handled = ctx.handled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "message processed"
        );
        result
    }
}

/// Stops errors and panics from later stages, logs them and apologizes.
pub struct ErrorBoundary;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

#[async_trait]
impl Middleware for ErrorBoundary {
    fn name(&self) -> &str {
        "error-boundary"
    }

    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
        let outcome = AssertUnwindSafe(next.run(ctx)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
        };

        error!(
            conversation_id = %ctx.event.conversation_id,
            sender_id = %ctx.event.sender_id,
            message_id = %ctx.event.message_id,
            error = %failure,
            "message handling failed"
        );
        if let Err(e) = ctx.reply(APOLOGY).await {
            warn!(conversation_id = %ctx.event.conversation_id, error = %e, "failed to send apology");
        }
        Ok(())
    }
}

/// Hands prefixed messages to the dispatcher, then continues the chain.
pub struct CommandStage {
    dispatcher: Arc<Dispatcher>,
}

impl CommandStage {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Middleware for CommandStage {
    fn name(&self) -> &str {
        "commands"
    }

    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> anyhow::Result<()> {
        if ctx.is_command && self.dispatcher.dispatch(Arc::clone(&ctx.event)).await {
            ctx.handled = true;
        }
        next.run(ctx).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::Recorder,
        parley_commands::Command,
        parley_common::{InboundEvent, Outbound},
        parley_config::{CommandsConfig, RateLimitConfig},
        parley_pipeline::Pipeline,
        parley_store::MemoryStore,
    };

    struct Fails(bool);

    #[async_trait]
    impl Middleware for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        async fn handle(&self, _ctx: &mut MessageContext, _next: Next<'_>) -> anyhow::Result<()> {
            if self.0 {
                panic!("stage exploded");
            }
            anyhow::bail!("stage failed")
        }
    }

    fn ctx(out: &Arc<Recorder>, body: &str) -> MessageContext {
        MessageContext::new(
            Arc::new(InboundEvent::text("chat-1", "alice", body)),
            Arc::clone(out) as Arc<dyn Outbound>,
            '!',
        )
    }

    #[tokio::test]
    async fn rate_gate_stops_chain_and_notifies() {
        let out = Arc::new(Recorder::default());
        let stats = Arc::new(GatewayStats::default());
        let limiter = Arc::new(RateLimiter::new(
            &RateLimitConfig {
                window_ms: 60_000,
                max_requests: 2,
                notify: true,
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &CommandsConfig::default(),
            Arc::clone(&out) as Arc<dyn Outbound>,
        ));
        dispatcher
            .register(Command::new("echo").handler_fn(|ctx| async move {
                ctx.reply(&ctx.args.join(" ")).await?;
                Ok(())
            }))
            .unwrap();

        let pipeline = Pipeline::new();
        pipeline
            .use_middleware(Arc::new(RateGate::new(limiter, Arc::clone(&stats), true)))
            .unwrap();
        pipeline
            .use_middleware(Arc::new(CommandStage::new(dispatcher)))
            .unwrap();

        for i in 0..3 {
            let mut c = ctx(&out, &format!("!echo {i}"));
            pipeline.run(&mut c).await.unwrap();
            let decision = c.rate_limit.unwrap();
            assert_eq!(decision.allowed, i < 2);
            assert_eq!(c.handled, i < 2);
        }
        assert_eq!(out.texts(), vec!["0", "1", RATE_LIMIT_NOTICE]);
        assert_eq!(stats.rejected(), 1);
    }

    #[tokio::test]
    async fn boundary_swallows_errors_and_panics() {
        for panics in [false, true] {
            let out = Arc::new(Recorder::default());
            let pipeline = Pipeline::new();
            pipeline.use_middleware(Arc::new(RequestLog)).unwrap();
            pipeline.use_middleware(Arc::new(ErrorBoundary)).unwrap();
            pipeline.use_middleware(Arc::new(Fails(panics))).unwrap();

            let mut c = ctx(&out, "hello");
            pipeline.run(&mut c).await.unwrap();
            assert_eq!(out.texts(), vec![APOLOGY]);
        }
    }

    #[tokio::test]
    async fn non_commands_skip_dispatch() {
        let out = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new(
            &CommandsConfig::default(),
            Arc::clone(&out) as Arc<dyn Outbound>,
        ));
        dispatcher
            .register(Command::new("hello").handler_fn(|ctx| async move {
                ctx.reply("hi").await?;
                Ok(())
            }))
            .unwrap();
        let stage = CommandStage::new(dispatcher);
        let pipeline = Pipeline::new();
        pipeline.use_middleware(Arc::new(stage)).unwrap();

        let mut c = ctx(&out, "hello");
        pipeline.run(&mut c).await.unwrap();
        assert!(!c.handled);
        assert!(out.texts().is_empty());
    }
}
