//! Per-conversation fixed-window rate limiting.
//!
//! Windows live in two places: a [`DashMap`] that answers "already
//! exhausted" without I/O, and a [`RateWindowStore`] whose atomic consume is
//! the source of truth. The store's answer always overwrites the memory copy.

use std::{sync::Arc, time::Duration};

use {
    dashmap::DashMap,
    parley_common::now_ms,
    parley_config::RateLimitConfig,
    parley_store::{RateWindow, RateWindowStore},
    serde::Serialize,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

/// Outcome of a single [`RateLimiter::check_and_consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub ms_until_reset: u64,
}

impl RateDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            ms_until_reset: 0,
        }
    }

    fn from_window(window: &RateWindow, allowed: bool, max_requests: u32, now_ms: u64) -> Self {
        Self {
            allowed,
            remaining: window.remaining(max_requests),
            ms_until_reset: window.ms_until_reset(now_ms),
        }
    }
}

pub struct RateLimiter {
    window_ms: u64,
    max_requests: u32,
    windows: DashMap<String, RateWindow>,
    store: Arc<dyn RateWindowStore>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, store: Arc<dyn RateWindowStore>) -> Self {
        Self {
            window_ms: config.window_ms,
            max_requests: config.max_requests,
            windows: DashMap::new(),
            store,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Number of conversations with a window held in memory.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    pub async fn check_and_consume(&self, conversation_id: &str) -> RateDecision {
        self.check_and_consume_at(conversation_id, now_ms()).await
    }

    pub async fn check_and_consume_at(&self, conversation_id: &str, now_ms: u64) -> RateDecision {
        if self.max_requests == 0 {
            return RateDecision::unlimited();
        }

        if let Some(window) = self.windows.get(conversation_id).map(|w| *w)
            && window.is_exhausted(now_ms, self.max_requests)
        {
            debug!(conversation_id, "rate window exhausted (memory)");
            return RateDecision::from_window(&window, false, self.max_requests, now_ms);
        }

        match self
            .store
            .consume(conversation_id, now_ms, self.window_ms, self.max_requests)
            .await
        {
            Ok(outcome) => {
                self.windows
                    .insert(conversation_id.to_string(), outcome.window);
                RateDecision::from_window(
                    &outcome.window,
                    outcome.accepted,
                    self.max_requests,
                    now_ms,
                )
            },
            Err(e) => {
                warn!(conversation_id, error = %e, "rate window store failed, allowing message");
                // Keep counting locally so a store outage still throttles on
                // the next request through the memory path.
                let mut entry = self
                    .windows
                    .entry(conversation_id.to_string())
                    .or_insert(RateWindow {
                        count: 0,
                        reset_at_ms: 0,
                    });
                let outcome =
                    RateWindow::consume(Some(*entry), now_ms, self.window_ms, self.max_requests);
                *entry = outcome.window;
                RateDecision::from_window(&outcome.window, true, self.max_requests, now_ms)
            },
        }
    }

    /// Forget a conversation's window in memory and in the store.
    pub async fn reset(&self, conversation_id: &str) {
        self.windows.remove(conversation_id);
        if let Err(e) = self.store.clear(conversation_id).await {
            warn!(conversation_id, error = %e, "failed to clear persisted rate window");
        }
    }

    /// Drop every expired window. Returns how many memory entries were removed.
    pub async fn sweep_at(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(now_ms));
        let removed = before - self.windows.len();

        match self.store.purge_expired(now_ms).await {
            Ok(purged) => debug!(removed, purged, "rate windows swept"),
            Err(e) => warn!(error = %e, "failed to purge persisted rate windows"),
        }
        removed
    }

    /// Run [`Self::sweep_at`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.sweep_at(now_ms()).await;
                    },
                }
            }
            info!("rate window sweeper stopped");
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        parley_store::{MemoryStore, SqliteStore, WindowOutcome},
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    fn config(window_ms: u64, max_requests: u32) -> RateLimitConfig {
        RateLimitConfig {
            window_ms,
            max_requests,
            ..Default::default()
        }
    }

    /// Counts store round-trips and can be switched to fail.
    struct ProbeStore {
        inner: MemoryStore,
        consumes: AtomicUsize,
        fail: bool,
    }

    impl ProbeStore {
        fn new(fail: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                consumes: AtomicUsize::new(0),
                fail,
            }
        }

        fn broken() -> parley_store::Error {
            parley_store::Error::Sqlx(sqlx::Error::PoolTimedOut)
        }
    }

    #[async_trait]
    impl RateWindowStore for ProbeStore {
        async fn consume(
            &self,
            conversation_id: &str,
            now_ms: u64,
            window_ms: u64,
            max_requests: u32,
        ) -> parley_store::Result<WindowOutcome> {
            self.consumes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Self::broken());
            }
            self.inner
                .consume(conversation_id, now_ms, window_ms, max_requests)
                .await
        }

        async fn load(&self, conversation_id: &str) -> parley_store::Result<Option<RateWindow>> {
            self.inner.load(conversation_id).await
        }

        async fn clear(&self, conversation_id: &str) -> parley_store::Result<()> {
            self.inner.clear(conversation_id).await
        }

        async fn purge_expired(&self, now_ms: u64) -> parley_store::Result<u64> {
            if self.fail {
                return Err(Self::broken());
            }
            self.inner.purge_expired(now_ms).await
        }
    }

    #[tokio::test]
    async fn allows_exactly_max_per_window() {
        let limiter = RateLimiter::new(&config(1_000, 3), Arc::new(MemoryStore::new()));

        for i in 0..3 {
            let d = limiter.check_and_consume_at("c1", 10_000 + i).await;
            assert!(d.allowed, "request {i} should pass");
            assert_eq!(d.remaining, 2 - i as u32);
        }

        let denied = limiter.check_and_consume_at("c1", 10_500).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.ms_until_reset, 500);

        // Other conversations are independent.
        assert!(limiter.check_and_consume_at("c2", 10_500).await.allowed);

        // After the window elapses another full batch is allowed.
        for _ in 0..3 {
            assert!(limiter.check_and_consume_at("c1", 11_000).await.allowed);
        }
        assert!(!limiter.check_and_consume_at("c1", 11_001).await.allowed);
    }

    #[tokio::test]
    async fn exhausted_memory_window_skips_store() {
        let store = Arc::new(ProbeStore::new(false));
        let limiter = RateLimiter::new(&config(1_000, 2), store.clone());

        limiter.check_and_consume_at("c1", 0).await;
        limiter.check_and_consume_at("c1", 1).await;
        assert_eq!(store.consumes.load(Ordering::SeqCst), 2);

        for t in 2..6 {
            assert!(!limiter.check_and_consume_at("c1", t).await.allowed);
        }
        assert_eq!(store.consumes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_decision_overrides_memory() {
        // Another process already used up the window in the shared store.
        let store = Arc::new(MemoryStore::new());
        for _ in 0..2 {
            store.consume("c1", 0, 1_000, 2).await.unwrap();
        }
        let limiter = RateLimiter::new(&config(1_000, 2), store);

        let d = limiter.check_and_consume_at("c1", 100).await;
        assert!(!d.allowed);
        assert_eq!(d.ms_until_reset, 900);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = RateLimiter::new(&config(1_000, 1), Arc::new(ProbeStore::new(true)));
        let d = limiter.check_and_consume_at("c1", 0).await;
        assert!(d.allowed);
        // Memory still counted the request.
        assert!(!limiter.check_and_consume_at("c1", 1).await.allowed);
    }

    #[tokio::test]
    async fn zero_max_disables_limiting() {
        let store = Arc::new(ProbeStore::new(false));
        let limiter = RateLimiter::new(&config(1_000, 0), store.clone());
        for t in 0..50 {
            assert!(limiter.check_and_consume_at("c1", t).await.allowed);
        }
        assert_eq!(store.consumes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reset_and_sweep() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(&config(1_000, 1), store.clone());

        limiter.check_and_consume_at("c1", 0).await;
        assert!(!limiter.check_and_consume_at("c1", 1).await.allowed);
        limiter.reset("c1").await;
        assert!(limiter.check_and_consume_at("c1", 2).await.allowed);

        limiter.check_and_consume_at("c2", 500).await;
        assert_eq!(limiter.tracked(), 2);
        assert_eq!(limiter.sweep_at(1_002).await, 1);
        assert_eq!(limiter.tracked(), 1);
        assert!(store.load("c1").await.unwrap().is_none());
        assert!(store.load("c2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn works_against_sqlite() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        parley_store::run_migrations(&pool).await.unwrap();
        let limiter = RateLimiter::new(&config(60_000, 2), Arc::new(SqliteStore::new(pool)));

        let mut results = Vec::new();
        for t in 0..3 {
            results.push(limiter.check_and_consume_at("c1", 1_000 + t).await.allowed);
        }
        assert_eq!(results, vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let limiter = Arc::new(RateLimiter::new(&config(1, 1), Arc::new(MemoryStore::new())));
        let cancel = CancellationToken::new();
        let handle = limiter.spawn_sweeper(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
