use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    parley_commands::Dispatcher,
    parley_common::Outbound,
    parley_config::RateLimitConfig,
    parley_pipeline::Pipeline,
    parley_plugins::PluginHost,
    parley_ratelimit::RateLimiter,
    parley_session::SessionManager,
    parley_store::Store,
    parley_webhook::{WebhookAuthenticator, WebhookBroadcaster},
};

/// Message counters surfaced on `/status`.
#[derive(Debug, Default)]
pub struct GatewayStats {
    processed: AtomicU64,
    rejected: AtomicU64,
}

impl GatewayStats {
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Everything the HTTP routes and the event loop share.
pub struct GatewayState {
    pub version: &'static str,
    pub started_at: Instant,
    pub session: SessionManager,
    /// The session's send capability, as handed to middlewares and commands.
    pub outbound: Arc<dyn Outbound>,
    pub dispatcher: Arc<Dispatcher>,
    pub pipeline: Arc<Pipeline>,
    pub limiter: Arc<RateLimiter>,
    pub plugins: Arc<PluginHost>,
    /// `None` while no webhook secret is configured.
    pub auth: Option<Arc<WebhookAuthenticator>>,
    pub broadcaster: Option<WebhookBroadcaster>,
    pub store: Arc<dyn Store>,
    pub stats: Arc<GatewayStats>,
    pub rate_limit: RateLimitConfig,
}

impl GatewayState {
    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
