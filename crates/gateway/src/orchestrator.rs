//! Wires the session, pipeline, dispatcher, limiter, plugins and webhook
//! surfaces together and drives them from the session's event channel.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    parley_commands::Dispatcher,
    parley_common::{Outbound, Result, now_ms},
    parley_config::ParleyConfig,
    parley_pipeline::{MessageContext, Pipeline},
    parley_plugins::{PluginHost, bundled},
    parley_ratelimit::RateLimiter,
    parley_session::{ChatTransport, SessionEvent, SessionManager},
    parley_store::{ConversationStore, RateWindowStore, Store, UsageStore},
    parley_webhook::{WebhookAuthenticator, WebhookBroadcaster},
    serde_json::json,
    tokio::{net::TcpListener, sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    builtin::register_builtins,
    middleware::{CommandStage, ErrorBoundary, RateGate, RequestLog},
    server::build_gateway_app,
    state::{GatewayState, GatewayStats},
};

/// Why [`Gateway::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The shutdown token fired.
    Shutdown,
    /// The session gave up reconnecting.
    ReconnectExhausted { attempts: u32 },
}

pub struct Gateway {
    state: Arc<GatewayState>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    respond_to_self: bool,
    sweep_interval: Duration,
}

impl Gateway {
    /// Build every component from `config`. Bundled plugins that fail to
    /// load are logged and skipped.
    pub async fn build(
        config: &ParleyConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn ChatTransport>,
    ) -> Result<Self> {
        let started_at = Instant::now();
        let (events_tx, events) = mpsc::unbounded_channel();

        let history: Arc<dyn ConversationStore> = store.clone();
        let session = SessionManager::new(&config.session, transport, events_tx).with_store(history);
        let outbound: Arc<dyn Outbound> = Arc::new(session.clone());

        let usage: Arc<dyn UsageStore> = store.clone();
        let dispatcher = Arc::new(
            Dispatcher::new(&config.commands, Arc::clone(&outbound)).with_usage_store(usage),
        );
        register_builtins(&dispatcher, session.clone(), started_at)?;

        let windows: Arc<dyn RateWindowStore> = store.clone();
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, windows));
        let stats = Arc::new(GatewayStats::default());

        let pipeline = Arc::new(Pipeline::new());
        pipeline.use_middleware(Arc::new(RateGate::new(
            Arc::clone(&limiter),
            Arc::clone(&stats),
            config.rate_limit.notify,
        )))?;
        pipeline.use_middleware(Arc::new(RequestLog))?;
        pipeline.use_middleware(Arc::new(ErrorBoundary))?;
        pipeline.use_middleware(Arc::new(CommandStage::new(Arc::clone(&dispatcher))))?;

        let plugins = Arc::new(PluginHost::new(
            Arc::clone(&dispatcher),
            Arc::clone(&pipeline),
            Arc::clone(&outbound),
        ));
        let loaded = plugins.load_all(bundled::from_config(&config.plugins)).await;

        let (auth, broadcaster) = if config.webhook.is_enabled() {
            let auth = Arc::new(WebhookAuthenticator::new(&config.webhook));
            let broadcaster = WebhookBroadcaster::new(&config.webhook, Arc::clone(&auth))?;
            (Some(auth), (!broadcaster.is_empty()).then_some(broadcaster))
        } else {
            info!("webhook secret not set, inbound webhook disabled");
            (None, None)
        };

        info!(
            commands = dispatcher.len(),
            plugins = loaded,
            middlewares = ?pipeline.names(),
            "gateway assembled"
        );

        Ok(Self {
            state: Arc::new(GatewayState {
                version: env!("CARGO_PKG_VERSION"),
                started_at,
                session,
                outbound,
                dispatcher,
                pipeline,
                limiter,
                plugins,
                auth,
                broadcaster,
                store,
                stats,
                rate_limit: config.rate_limit.clone(),
            }),
            events,
            respond_to_self: config.commands.respond_to_self,
            sweep_interval: Duration::from_millis(config.rate_limit.sweep_interval_ms.max(1)),
        })
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Serve HTTP on `listener`, start the session and process its events
    /// until `shutdown` fires or reconnection is abandoned. Everything is
    /// torn down before returning.
    pub async fn run(mut self, listener: TcpListener, shutdown: CancellationToken) -> Result<Exit> {
        let background = CancellationToken::new();
        let sweeper = self
            .state
            .limiter
            .spawn_sweeper(self.sweep_interval, background.clone());
        let cooldown_sweeper = spawn_cooldown_sweeper(
            Arc::clone(&self.state.dispatcher),
            self.sweep_interval,
            background.clone(),
        );

        let addr = listener.local_addr()?;
        let app = build_gateway_app(Arc::clone(&self.state));
        let server_stop = background.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_stop.cancelled().await })
                .await
        });
        info!(addr = %addr, "gateway listening");

        if let Err(e) = self.state.session.initialize().await {
            warn!(error = %e, "initial connection failed, retrying in background");
        }

        let exit = loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break Exit::Shutdown,
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                break Exit::Shutdown;
            };
            if let Some(exit) = self.handle_event(event).await {
                break exit;
            }
        };

        info!(?exit, "gateway shutting down");
        background.cancel();
        self.state.plugins.shutdown().await;
        self.state.session.destroy().await;
        let _ = sweeper.await;
        let _ = cooldown_sweeper.await;
        match server.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(error = %e, "http server stopped with an error"),
            Err(e) => warn!(error = %e, "http server task failed"),
        }
        Ok(exit)
    }

    async fn handle_event(&self, event: SessionEvent) -> Option<Exit> {
        match event {
            SessionEvent::Message(message) => {
                if message.from_me && !self.respond_to_self {
                    debug!(message_id = %message.message_id, "skipping own message");
                    return None;
                }
                self.state.stats.record_processed();
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    let mut ctx = MessageContext::new(
                        message,
                        Arc::clone(&state.outbound),
                        state.dispatcher.prefix(),
                    );
                    if let Err(e) = state.pipeline.run(&mut ctx).await {
                        warn!(message_id = %ctx.event.message_id, error = %format!("{e:#}"), "pipeline error");
                    }
                });
                None
            },
            SessionEvent::ReconnectExhausted { attempts } => {
                error!(attempts, "session reconnection exhausted");
                // Delivered before teardown so subscribers hear about it.
                self.broadcast(&SessionEvent::ReconnectExhausted { attempts })
                    .await;
                Some(Exit::ReconnectExhausted { attempts })
            },
            lifecycle => {
                if self.state.broadcaster.is_some() {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move { broadcast_with(&state, &lifecycle).await });
                }
                None
            },
        }
    }

    async fn broadcast(&self, event: &SessionEvent) {
        broadcast_with(&self.state, event).await;
    }
}

/// Periodically drop cooldown records that can no longer block a command.
fn spawn_cooldown_sweeper(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    dispatcher.prune_cooldowns(now_ms());
                },
            }
        }
        debug!("cooldown sweeper stopped");
    })
}

async fn broadcast_with(state: &GatewayState, event: &SessionEvent) {
    let Some(broadcaster) = &state.broadcaster else {
        return;
    };
    let Some(data) = event_payload(event) else {
        return;
    };
    match broadcaster.broadcast(event.kind(), data).await {
        Ok(report) => debug!(
            event = event.kind(),
            delivered = report.delivered,
            failed = report.failed,
            "lifecycle event broadcast"
        ),
        Err(e) => warn!(event = event.kind(), error = %e, "lifecycle broadcast failed"),
    }
}

/// Broadcast body for a lifecycle event. Messages are not broadcast.
pub fn event_payload(event: &SessionEvent) -> Option<serde_json::Value> {
    let data = match event {
        SessionEvent::CredentialIssued { credential } => json!({ "qr": credential }),
        SessionEvent::Authenticated => json!({}),
        SessionEvent::Connected { account } => json!({ "account": account }),
        SessionEvent::Disconnected { reason } => json!({ "reason": reason }),
        SessionEvent::Reconnecting { attempt, delay_ms } => {
            json!({ "attempt": attempt, "delay_ms": delay_ms })
        },
        SessionEvent::HealthCheckFailed { error } => json!({ "error": error }),
        SessionEvent::ReconnectExhausted { attempts } => json!({ "attempts": attempts }),
        SessionEvent::Message(_) => return None,
    };
    Some(data)
}
