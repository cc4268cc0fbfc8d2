//! Session state machine.
//!
//! All mutable state sits behind one `std::sync::Mutex` that is never held
//! across an `.await`. Every transport connection gets a generation number;
//! events, timers and probes tagged with an older generation are dropped.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    parley_common::{DeliveryReceipt, Error, Outbound, Result, now_ms},
    parley_config::SessionConfig,
    parley_store::{ConversationRecord, ConversationStore},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    backoff::backoff_delay,
    event::SessionEvent,
    state::{SessionSnapshot, SessionState},
    transport::{ChatTransport, DisconnectReason, TransportEvent},
};

#[derive(Debug, Clone, Copy)]
struct Timing {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
    qr_refresh: Duration,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl From<&SessionConfig> for Timing {
    fn from(c: &SessionConfig) -> Self {
        Self {
            base_delay_ms: c.reconnect_base_delay_ms,
            max_delay_ms: c.reconnect_max_delay_ms,
            max_attempts: c.max_reconnect_attempts,
            qr_refresh: Duration::from_millis(c.qr_refresh_interval_ms.max(1)),
            probe_interval: Duration::from_millis(c.health_check_interval_ms.max(1)),
            probe_timeout: Duration::from_millis(c.health_check_timeout_ms),
        }
    }
}

struct Shared {
    state: SessionState,
    attempt: u32,
    generation: u64,
    credential: Option<String>,
    last_credential_at_ms: Option<u64>,
    connected_since_ms: Option<u64>,
    account: Option<String>,
    refresh: Option<CancellationToken>,
    probe: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
    pump: Option<CancellationToken>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            attempt: 0,
            generation: 0,
            credential: None,
            last_credential_at_ms: None,
            connected_since_ms: None,
            account: None,
            refresh: None,
            probe: None,
            reconnect: None,
            pump: None,
        }
    }

    fn cancel_timers(&mut self) {
        for slot in [
            &mut self.refresh,
            &mut self.probe,
            &mut self.reconnect,
            &mut self.pump,
        ] {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }
}

fn cancel(slot: &mut Option<CancellationToken>) {
    if let Some(token) = slot.take() {
        token.cancel();
    }
}

struct Inner {
    timing: Timing,
    transport: Arc<dyn ChatTransport>,
    store: Option<Arc<dyn ConversationStore>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shared: Mutex<Shared>,
}

/// Owns the chat-network session and keeps it alive.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: &SessionConfig,
        transport: Arc<dyn ChatTransport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                timing: Timing::from(config),
                transport,
                store: None,
                events,
                shared: Mutex::new(Shared::new()),
            }),
        }
    }

    /// Persist every inbound message to `store` before it is emitted.
    ///
    /// Must be called before the manager is cloned or initialized.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.store = Some(store);
        } else {
            warn!("session manager already shared, conversation store ignored");
        }
        self
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.inner.lock();
        SessionSnapshot {
            state: s.state,
            attempt: s.attempt,
            last_credential_at_ms: s.last_credential_at_ms,
            connected_since_ms: s.connected_since_ms,
            account: s.account.clone(),
        }
    }

    /// The pairing credential currently waiting to be scanned.
    pub fn credential(&self) -> Option<String> {
        let s = self.inner.lock();
        (s.state == SessionState::AwaitingCredential)
            .then(|| s.credential.clone())
            .flatten()
    }

    /// Open the transport and start the state machine.
    ///
    /// Only acts from `Disconnected` or `Failed`; anything else is a no-op.
    /// Returns once the transport is open. If opening fails the error is
    /// returned and reconnection is scheduled as for any other disconnect.
    pub async fn initialize(&self) -> Result<()> {
        let generation = {
            let mut s = self.inner.lock();
            match s.state {
                SessionState::Disconnected => {},
                SessionState::Failed => {
                    info!("restarting failed session");
                    s.state = SessionState::Disconnected;
                    s.attempt = 0;
                },
                other => {
                    debug!(state = %other, "initialize ignored, session already active");
                    return Ok(());
                },
            }
            s.state = SessionState::AwaitingCredential;
            s.generation += 1;
            s.generation
        };

        info!("initializing session");
        match self.inner.transport.open().await {
            Ok(rx) => {
                self.inner.start_pump(generation, rx);
                Ok(())
            },
            Err(e) => {
                warn!(error = %e, "failed to open chat transport");
                {
                    let mut s = self.inner.lock();
                    if s.generation == generation {
                        s.state = SessionState::Disconnected;
                    }
                }
                self.inner.emit(SessionEvent::Disconnected {
                    reason: e.to_string(),
                });
                self.inner.schedule_reconnect(generation);
                Err(e)
            },
        }
    }

    /// Cancel all timers and tasks, then close the transport.
    pub async fn destroy(&self) {
        {
            let mut s = self.inner.lock();
            s.cancel_timers();
            s.generation += 1;
            s.state = SessionState::Disconnected;
            s.credential = None;
            s.connected_since_ms = None;
        }
        if let Err(e) = self.inner.transport.close().await {
            debug!(error = %e, "transport close failed during destroy");
        }
        info!("session destroyed");
    }

    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(Error::not_connected(state));
        }
        self.inner.transport.send_text(conversation_id, text).await
    }
}

#[async_trait]
impl Outbound for SessionManager {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt> {
        self.send(conversation_id, text).await
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        debug!(event = event.kind(), "session event");
        // The owner may have stopped listening during shutdown.
        let _ = self.events.send(event);
    }

    fn start_pump(self: &Arc<Self>, generation: u64, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let token = CancellationToken::new();
        {
            let mut s = self.lock();
            if s.generation != generation {
                debug!(generation, "transport opened for a superseded connection");
                return;
            }
            cancel(&mut s.pump);
            s.pump = Some(token.clone());
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => return,
                    event = rx.recv() => event,
                };
                match event {
                    Some(event) => inner.on_transport_event(generation, event).await,
                    None => {
                        inner
                            .on_transport_event(
                                generation,
                                TransportEvent::Disconnected(DisconnectReason::Other(
                                    "transport stream closed".into(),
                                )),
                            )
                            .await;
                        return;
                    },
                }
            }
        });
    }

    async fn on_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        if self.lock().generation != generation {
            debug!(generation, "ignoring event from superseded connection");
            return;
        }

        match event {
            TransportEvent::Credential(credential) => {
                {
                    let mut s = self.lock();
                    if s.generation != generation {
                        return;
                    }
                    s.state = SessionState::AwaitingCredential;
                    s.credential = Some(credential.clone());
                    s.last_credential_at_ms = Some(now_ms());
                }
                info!("pairing credential issued");
                self.start_refresh_timer(generation);
                self.emit(SessionEvent::CredentialIssued { credential });
            },
            TransportEvent::Authenticated => {
                {
                    let mut s = self.lock();
                    if s.generation != generation {
                        return;
                    }
                    s.state = SessionState::Authenticating;
                    s.credential = None;
                    cancel(&mut s.refresh);
                }
                info!("session authenticated");
                self.emit(SessionEvent::Authenticated);
            },
            TransportEvent::Ready { account } => {
                {
                    let mut s = self.lock();
                    if s.generation != generation {
                        return;
                    }
                    s.state = SessionState::Connected;
                    s.attempt = 0;
                    s.credential = None;
                    s.connected_since_ms = Some(now_ms());
                    s.account = account.clone();
                    cancel(&mut s.refresh);
                    cancel(&mut s.reconnect);
                }
                info!(account = ?account, "session connected");
                self.start_probe(generation);
                self.emit(SessionEvent::Connected { account });
            },
            TransportEvent::Message(message) => {
                if let Some(store) = &self.store
                    && let Err(e) = store.save(&ConversationRecord::from(&message)).await
                {
                    warn!(
                        message_id = %message.message_id,
                        conversation_id = %message.conversation_id,
                        error = %e,
                        "failed to persist inbound message"
                    );
                }
                self.emit(SessionEvent::Message(Arc::new(message)));
            },
            TransportEvent::Disconnected(reason) => {
                self.on_connection_lost(generation, reason);
            },
        }
    }

    fn on_connection_lost(self: &Arc<Self>, generation: u64, reason: DisconnectReason) {
        {
            let mut s = self.lock();
            if s.generation != generation {
                return;
            }
            cancel(&mut s.refresh);
            cancel(&mut s.probe);
            s.connected_since_ms = None;
            s.credential = None;
            if reason == DisconnectReason::Navigation {
                cancel(&mut s.pump);
                s.state = SessionState::Disconnected;
            }
        }
        warn!(reason = %reason, "session disconnected");
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
        if reason != DisconnectReason::Navigation {
            self.schedule_reconnect(generation);
        }
    }

    /// Arm the single reconnect timer, or fail terminally once the attempt
    /// budget is spent. A no-op while a timer is already pending.
    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let (token, attempt, delay) = {
            let mut s = self.lock();
            if s.generation != generation || s.state == SessionState::Failed {
                return;
            }
            if s.reconnect.is_some() {
                debug!("reconnect already scheduled");
                return;
            }
            if s.attempt >= self.timing.max_attempts {
                let attempts = s.attempt;
                s.cancel_timers();
                s.state = SessionState::Failed;
                drop(s);
                warn!(attempts, "giving up on reconnection");
                self.emit(SessionEvent::ReconnectExhausted { attempts });
                return;
            }

            let delay = backoff_delay(
                self.timing.base_delay_ms,
                self.timing.max_delay_ms,
                s.attempt,
            );
            s.attempt += 1;
            s.state = SessionState::Reconnecting;
            let token = CancellationToken::new();
            s.reconnect = Some(token.clone());
            (token, s.attempt, delay)
        };

        let delay_ms = delay.as_millis() as u64;
        info!(attempt, delay_ms, "reconnecting");
        self.emit(SessionEvent::Reconnecting { attempt, delay_ms });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {},
                () = tokio::time::sleep(delay) => inner.reconnect_now(generation).await,
            }
        });
    }

    async fn reconnect_now(self: &Arc<Self>, previous: u64) {
        let generation = {
            let mut s = self.lock();
            s.reconnect = None;
            if s.generation != previous || s.state != SessionState::Reconnecting {
                return;
            }
            cancel(&mut s.pump);
            cancel(&mut s.probe);
            s.generation += 1;
            s.generation
        };

        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "closing stale transport failed");
        }

        match self.transport.open().await {
            Ok(rx) => self.start_pump(generation, rx),
            Err(e) => {
                warn!(error = %e, "reconnection attempt failed");
                self.schedule_reconnect(generation);
            },
        }
    }

    fn start_refresh_timer(self: &Arc<Self>, generation: u64) {
        let token = {
            let mut s = self.lock();
            if s.generation != generation || s.refresh.is_some() {
                return;
            }
            let token = CancellationToken::new();
            s.refresh = Some(token.clone());
            token
        };

        let inner = Arc::clone(self);
        let period = self.timing.qr_refresh;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {},
                }
                {
                    let s = inner.lock();
                    if s.generation != generation || s.state != SessionState::AwaitingCredential {
                        return;
                    }
                }
                debug!("requesting fresh pairing credential");
                if let Err(e) = inner.transport.refresh_credential().await {
                    warn!(error = %e, "credential refresh failed");
                }
            }
        });
    }

    fn start_probe(self: &Arc<Self>, generation: u64) {
        let token = {
            let mut s = self.lock();
            if s.generation != generation {
                return;
            }
            cancel(&mut s.probe);
            let token = CancellationToken::new();
            s.probe = Some(token.clone());
            token
        };

        let inner = Arc::clone(self);
        let (period, timeout) = (self.timing.probe_interval, self.timing.probe_timeout);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {},
                }
                let error = match tokio::time::timeout(timeout, inner.transport.ping()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("no answer within {}ms", timeout.as_millis()),
                };
                if token.is_cancelled() {
                    return;
                }
                warn!(error = %error, "health check failed");
                inner.emit(SessionEvent::HealthCheckFailed { error });
                let connected = {
                    let s = inner.lock();
                    s.generation == generation && s.state == SessionState::Connected
                };
                if connected {
                    inner.on_connection_lost(
                        generation,
                        DisconnectReason::Other("health check failed".into()),
                    );
                }
                return;
            }
        });
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        parley_common::InboundEvent,
        parley_store::MemoryStore,
        std::{
            collections::VecDeque,
            sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    enum Script {
        Open(Vec<TransportEvent>),
        Fail,
    }

    /// Transport driven by a queue of scripted `open` outcomes.
    #[derive(Default)]
    struct FakeTransport {
        script: Mutex<VecDeque<Script>>,
        current: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
        opens: AtomicUsize,
        closes: AtomicUsize,
        refreshes: AtomicUsize,
        pings: AtomicUsize,
        ping_fails: AtomicBool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl FakeTransport {
        fn with(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn push(&self, event: TransportEvent) {
            let tx = self.current.lock().unwrap().clone().unwrap();
            tx.send(event).unwrap();
        }

        fn sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
            self.current.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl ChatTransport for FakeTransport {
        async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Script::Open(events)) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    for e in events {
                        tx.send(e).unwrap();
                    }
                    *self.current.lock().unwrap() = Some(tx);
                    Ok(rx)
                },
                Some(Script::Fail) | None => Err(Error::transport("connection refused")),
            }
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_text(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id.into(), text.into()));
            Ok(DeliveryReceipt {
                message_id: "out-1".into(),
                conversation_id: conversation_id.into(),
                sent_at_ms: now_ms(),
            })
        }

        async fn ping(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.ping_fails.load(Ordering::SeqCst) {
                return Err(Error::transport("ping failed"));
            }
            Ok(())
        }

        async fn refresh_credential(&self) -> Result<()> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(tx) = self.current.lock().unwrap().as_ref() {
                let _ = tx.send(TransportEvent::Credential(format!("qr-{}", n + 1)));
            }
            Ok(())
        }
    }

    fn inbound(conversation: &str, body: &str) -> InboundEvent {
        InboundEvent::text(conversation, "alice", body)
    }

    fn config() -> SessionConfig {
        SessionConfig {
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 8_000,
            max_reconnect_attempts: 3,
            qr_refresh_interval_ms: 30_000,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    fn happy_path() -> Script {
        Script::Open(vec![
            TransportEvent::Credential("qr-1".into()),
            TransportEvent::Authenticated,
            TransportEvent::Ready {
                account: Some("me@chat".into()),
            },
        ])
    }

    fn ready() -> Script {
        Script::Open(vec![TransportEvent::Ready { account: None }])
    }

    fn manager(
        transport: &Arc<FakeTransport>,
    ) -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn ChatTransport> = Arc::clone(transport) as Arc<dyn ChatTransport>;
        (SessionManager::new(&config(), transport, tx), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(3_600), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    async fn wait_for<F: Fn(&SessionEvent) -> bool>(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        pred: F,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let ev = next(rx).await;
            let done = pred(&ev);
            seen.push(ev);
            if done {
                return seen;
            }
        }
    }

    fn is_connected(ev: &SessionEvent) -> bool {
        matches!(ev, SessionEvent::Connected { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_reaches_connected() {
        let transport = FakeTransport::with(vec![happy_path()]);
        let (session, mut rx) = manager(&transport);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.initialize().await.unwrap();
        let events = wait_for(&mut rx, is_connected).await;
        let kinds: Vec<_> = events.iter().map(SessionEvent::kind).collect();
        assert_eq!(kinds, vec![
            "session.credential_issued",
            "session.authenticated",
            "session.connected"
        ]);

        let snap = session.snapshot();
        assert_eq!(snap.state, SessionState::Connected);
        assert_eq!(snap.attempt, 0);
        assert_eq!(snap.account.as_deref(), Some("me@chat"));
        assert!(snap.last_credential_at_ms.is_some());
        assert!(snap.connected_since_ms.is_some());
        assert!(session.credential().is_none());

        // Already active: no second open.
        session.initialize().await.unwrap();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_refreshes_until_scanned() {
        let transport = FakeTransport::with(vec![Script::Open(vec![TransportEvent::Credential(
            "qr-1".into(),
        )])]);
        let (session, mut rx) = manager(&transport);
        session.initialize().await.unwrap();
        next(&mut rx).await;
        assert_eq!(session.state(), SessionState::AwaitingCredential);
        assert_eq!(session.credential().as_deref(), Some("qr-1"));

        tokio::time::sleep(Duration::from_millis(60_001)).await;
        assert_eq!(transport.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(session.credential().as_deref(), Some("qr-3"));

        transport.push(TransportEvent::Authenticated);
        wait_for(&mut rx, |e| matches!(e, SessionEvent::Authenticated)).await;
        assert_eq!(session.state(), SessionState::Authenticating);

        tokio::time::sleep(Duration::from_millis(120_000)).await;
        assert_eq!(transport.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_exactly_once() {
        let transport = FakeTransport::with(vec![ready(), Script::Fail, Script::Fail, Script::Fail]);
        let (session, mut rx) = manager(&transport);
        session.initialize().await.unwrap();
        wait_for(&mut rx, is_connected).await;

        transport.push(TransportEvent::Disconnected(DisconnectReason::Other(
            "stream errored".into(),
        )));
        let events = wait_for(&mut rx, |e| {
            matches!(e, SessionEvent::ReconnectExhausted { .. })
        })
        .await;

        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Reconnecting { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::ReconnectExhausted { attempts: 3 })
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 4);

        // Nothing else fires once failed.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            session.send("c", "hi").await,
            Err(Error::NotConnected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_restarts_a_failed_session() {
        let transport = FakeTransport::with(vec![Script::Fail, Script::Fail, Script::Fail, Script::Fail, ready()]);
        let (session, mut rx) = manager(&transport);

        assert!(session.initialize().await.is_err());
        wait_for(&mut rx, |e| {
            matches!(e, SessionEvent::ReconnectExhausted { .. })
        })
        .await;
        assert_eq!(session.state(), SessionState::Failed);

        session.initialize().await.unwrap();
        wait_for(&mut rx, is_connected).await;
        assert_eq!(session.snapshot().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_success_resets_attempts_and_ignores_stale_events() {
        let transport = FakeTransport::with(vec![ready(), Script::Fail, ready()]);
        let (session, mut rx) = manager(&transport);
        session.initialize().await.unwrap();
        wait_for(&mut rx, is_connected).await;

        let stale = transport.sender();
        transport.push(TransportEvent::Disconnected(DisconnectReason::LoggedOut));
        wait_for(&mut rx, is_connected).await;
        assert_eq!(session.snapshot().attempt, 0);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);

        // The old connection's stream is no longer read.
        let _ = stale.send(TransportEvent::Disconnected(DisconnectReason::Other(
            "late".into(),
        )));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_close_is_not_retried() {
        let transport = FakeTransport::with(vec![ready()]);
        let (session, mut rx) = manager(&transport);
        session.initialize().await.unwrap();
        wait_for(&mut rx, is_connected).await;

        transport.push(TransportEvent::Disconnected(DisconnectReason::Navigation));
        let ev = next(&mut rx).await;
        assert!(matches!(ev, SessionEvent::Disconnected { .. }));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_triggers_reconnect() {
        let transport = FakeTransport::with(vec![ready(), ready()]);
        let (session, mut rx) = manager(&transport);
        session.initialize().await.unwrap();
        wait_for(&mut rx, is_connected).await;

        transport.ping_fails.store(true, Ordering::SeqCst);
        let events = wait_for(&mut rx, |e| {
            matches!(e, SessionEvent::Reconnecting { .. })
        })
        .await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::HealthCheckFailed { .. }))
        );

        transport.ping_fails.store(false, Ordering::SeqCst);
        wait_for(&mut rx, is_connected).await;
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_persisted_before_emission() {
        let store = Arc::new(MemoryStore::new());
        let transport = FakeTransport::with(vec![ready()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = SessionManager::new(&config(), transport.clone(), tx)
            .with_store(store.clone());
        session.initialize().await.unwrap();
        wait_for(&mut rx, is_connected).await;

        transport.push(TransportEvent::Message(inbound("chat-1", "hello")));
        transport.push(TransportEvent::Message(inbound("chat-1", "again").from_self()));
        for _ in 0..2 {
            let SessionEvent::Message(msg) = next(&mut rx).await else {
                panic!("expected message");
            };
            let saved = store.recent("chat-1", 10).await.unwrap();
            assert!(saved.iter().any(|r| r.message_id == msg.message_id));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connection() {
        let transport = FakeTransport::with(vec![ready()]);
        let (session, mut rx) = manager(&transport);
        assert!(matches!(
            session.send("c", "hi").await,
            Err(Error::NotConnected { .. })
        ));

        session.initialize().await.unwrap();
        wait_for(&mut rx, is_connected).await;
        let receipt = session.send_text("c", "hi").await.unwrap();
        assert_eq!(receipt.conversation_id, "c");
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_cancels_timers() {
        let transport = FakeTransport::with(vec![Script::Open(vec![TransportEvent::Credential(
            "qr-1".into(),
        )])]);
        let (session, mut rx) = manager(&transport);
        session.initialize().await.unwrap();
        next(&mut rx).await;

        session.destroy().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(transport.pings.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }
}
