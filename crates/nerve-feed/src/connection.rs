//! Push-channel connection manager.
//!
//! Owns one logical connection and its reconnect policy:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Open
//!      ^                          |                 |
//!      |                          +---close/error---+--> ReconnectPending
//!      |                                                      |
//!  disconnect() (from any state)          Connecting <--timer-+
//! ```
//!
//! Every connection attempt gets a new generation number. Socket callbacks
//! and reconnect timers carry the generation they were started under and
//! are ignored once it is no longer current, so nothing started before a
//! `disconnect()` can change state after it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use nerve_core::{ConnectionState, Event, TransportError};

use crate::dispatcher::{EventDispatcher, Subscription};
use crate::transport::{Connection, Connector};

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Text frame the backend answers with a `pong` event.
const KEEPALIVE_MESSAGE: &str = "ping";

// ─── Policy ─────────────────────────────────────────────────────────

/// How long to wait before reconnecting after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay every time.
    Fixed(Duration),
    /// `initial * 2^failures`, capped at `max`. Resets once a connection opens.
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before the next attempt, given consecutive failures so far.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(consecutive_failures).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

// ─── Stats ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Physical connection attempts started.
    pub connect_attempts: u64,
    /// Reconnect timers scheduled.
    pub reconnects_scheduled: u64,
    /// Events handed to the dispatcher.
    pub events_dispatched: u64,
}

// ─── Internal state ─────────────────────────────────────────────────

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Machine {
    state: ConnectionState,
    generation: u64,
    /// Current (or last, possibly closing) session task.
    session: Option<Session>,
    /// Pending reconnect timer. At most one.
    reconnect: Option<CancellationToken>,
    keepalive: Option<Duration>,
    /// Set by the first explicit or implicit `connect()` or by `disconnect()`.
    /// Never cleared.
    lifecycle_started: bool,
    consecutive_failures: u32,
    stats: ConnectionStats,
}

struct Shared<C: Connector> {
    connector: C,
    dispatcher: EventDispatcher,
    policy: ReconnectPolicy,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<ConnectionState>,
}

// ─── ConnectionManager ──────────────────────────────────────────────

/// One logical push connection feeding an [`EventDispatcher`].
///
/// Must be used from inside a tokio runtime: `connect()` spawns the socket
/// task and reconnect timers. Dropping the manager disconnects it.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, dispatcher: EventDispatcher) -> Self {
        Self::with_policy(connector, dispatcher, ReconnectPolicy::default())
    }

    pub fn with_policy(connector: C, dispatcher: EventDispatcher, policy: ReconnectPolicy) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                dispatcher,
                policy,
                machine: Mutex::new(Machine {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    session: None,
                    reconnect: None,
                    keepalive: None,
                    lifecycle_started: false,
                    consecutive_failures: 0,
                    stats: ConnectionStats::default(),
                }),
                state_tx,
            }),
        }
    }

    /// Send a `ping` text frame at this interval while open. Zero disables.
    ///
    /// Takes effect from the next connection attempt.
    #[must_use]
    pub fn with_keepalive(self, interval: Duration) -> Self {
        self.shared.machine().keepalive = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Start connecting. No effect while `Connecting` or `Open`; from
    /// `ReconnectPending` the pending timer is replaced by an immediate attempt.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Close the connection, cancel any pending reconnect and stay
    /// `Disconnected` until the next `connect()`. Safe in any state.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Subscribe to the dispatcher. The first subscribe on a manager that
    /// was never connected or disconnected starts the connection; later
    /// subscribes leave the lifecycle alone.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let subscription = self.shared.dispatcher.subscribe(callback);
        self.shared.connect_implicitly();
        subscription
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.machine().state
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.shared.machine().reconnect.is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.machine().stats
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.shared.dispatcher
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.shared.policy
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl<C: Connector> Shared<C> {
    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, m: &mut Machine, state: ConnectionState) {
        m.state = state;
        self.state_tx.send_replace(state);
    }

    fn connect(self: &Arc<Self>) {
        let mut m = self.machine();
        m.lifecycle_started = true;
        if m.state.is_active() {
            return;
        }
        if let Some(timer) = m.reconnect.take() {
            timer.cancel();
        }
        tracing::info!("feed: connect requested");
        self.start_attempt(&mut m);
    }

    /// Connect only if nothing has touched the lifecycle yet.
    fn connect_implicitly(self: &Arc<Self>) {
        let mut m = self.machine();
        if m.lifecycle_started {
            return;
        }
        m.lifecycle_started = true;
        tracing::info!("feed: first subscriber, connecting");
        self.start_attempt(&mut m);
    }

    fn disconnect(&self) {
        let mut m = self.machine();
        m.lifecycle_started = true;
        m.generation += 1;
        if let Some(timer) = m.reconnect.take() {
            timer.cancel();
        }
        if let Some(session) = &m.session {
            session.cancel.cancel();
        }
        m.consecutive_failures = 0;
        if m.state != ConnectionState::Disconnected {
            tracing::info!(from = %m.state, "feed: disconnected");
        }
        self.publish(&mut m, ConnectionState::Disconnected);
    }

    /// Begin a new physical attempt under a fresh generation.
    fn start_attempt(self: &Arc<Self>, m: &mut Machine) {
        m.generation += 1;
        m.stats.connect_attempts += 1;
        let generation = m.generation;
        self.publish(m, ConnectionState::Connecting);

        // Wait for the previous socket task to finish closing so that at most
        // one physical connection exists at a time.
        let previous = m.session.take().map(|s| {
            s.cancel.cancel();
            s.task
        });
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            shared.run_session(generation, token).await;
        });
        m.session = Some(Session { cancel, task });
    }

    async fn run_session(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let attempt = tokio::select! {
            () = cancel.cancelled() => return,
            result = self.connector.connect() => result,
        };
        let mut conn = match attempt {
            Ok(conn) => conn,
            Err(e) => {
                self.on_closed(generation, Some(e));
                return;
            }
        };
        if !self.on_open(generation) {
            conn.close().await;
            return;
        }

        let keepalive = self.machine().keepalive;
        let mut keepalive = keepalive.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    conn.close().await;
                    return;
                }
                frame = conn.recv() => match frame {
                    Some(Ok(text)) => self.on_message(generation, &text),
                    Some(Err(e)) => {
                        self.on_closed(generation, Some(e));
                        return;
                    }
                    None => {
                        self.on_closed(generation, None);
                        return;
                    }
                },
                () = next_tick(&mut keepalive) => {
                    if let Err(e) = conn.send_text(KEEPALIVE_MESSAGE.to_string()).await {
                        self.on_closed(generation, Some(e));
                        return;
                    }
                }
            }
        }
    }

    fn on_open(&self, generation: u64) -> bool {
        let mut m = self.machine();
        if m.generation != generation || m.state != ConnectionState::Connecting {
            tracing::debug!(generation, "feed: late open ignored");
            return false;
        }
        if let Some(timer) = m.reconnect.take() {
            timer.cancel();
        }
        m.consecutive_failures = 0;
        self.publish(&mut m, ConnectionState::Open);
        tracing::info!(generation, "feed: connection open");
        true
    }

    fn on_message(&self, generation: u64, text: &str) {
        let event = match Event::decode(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "feed: dropping undecodable message");
                return;
            }
        };
        {
            let mut m = self.machine();
            if m.generation != generation {
                return;
            }
            m.stats.events_dispatched += 1;
        }
        // The generation is re-checked before every callback, so once a
        // handler disconnects only that handler finishes with this event.
        self.dispatcher
            .dispatch_while(&event, || self.machine().generation == generation);
    }

    /// Single path for unexpected close, transport error and failed connect.
    fn on_closed(self: &Arc<Self>, generation: u64, error: Option<TransportError>) {
        let mut m = self.machine();
        if m.generation != generation {
            tracing::debug!(generation, "feed: close from stale connection ignored");
            return;
        }
        match m.state {
            ConnectionState::Connecting | ConnectionState::Open => {}
            ConnectionState::ReconnectPending | ConnectionState::Disconnected => return,
        }
        if m.reconnect.is_some() {
            return;
        }

        let delay = self.policy.delay(m.consecutive_failures);
        m.consecutive_failures = m.consecutive_failures.saturating_add(1);
        match &error {
            Some(e) => tracing::warn!(
                error = %e,
                from = %m.state,
                delay_ms = delay.as_millis() as u64,
                "feed: transport error, reconnect scheduled"
            ),
            None => tracing::warn!(
                from = %m.state,
                delay_ms = delay.as_millis() as u64,
                "feed: connection closed, reconnect scheduled"
            ),
        }
        self.publish(&mut m, ConnectionState::ReconnectPending);

        let timer = CancellationToken::new();
        m.reconnect = Some(timer.clone());
        m.stats.reconnects_scheduled += 1;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = tokio::time::sleep(delay) => shared.fire_reconnect(generation),
            }
        });
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let mut m = self.machine();
        if m.generation != generation || m.state != ConnectionState::ReconnectPending {
            return;
        }
        m.reconnect = None;
        tracing::debug!(generation, "feed: reconnect timer fired");
        self.start_attempt(&mut m);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    // ── Scripted transport ──────────────────────────────────────────

    enum Frame {
        Text(String),
        Error,
        Close,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        attempts: Arc<AtomicUsize>,
        refuse: Arc<AtomicUsize>,
        links: Arc<Mutex<Vec<mpsc::UnboundedSender<Frame>>>>,
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Fail the next `n` connect calls.
        fn refuse_next(&self, n: usize) {
            self.refuse.store(n, Ordering::SeqCst);
        }

        fn push(&self, frame: Frame) {
            let links = self.links.lock().unwrap();
            let link = links.last().expect("no connection opened yet");
            let _ = link.send(frame);
        }
    }

    struct FakeConn {
        rx: mpsc::UnboundedReceiver<Frame>,
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicUsize>,
    }

    impl Connector for FakeConnector {
        type Conn = FakeConn;

        async fn connect(&self) -> Result<FakeConn, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refuse = self.refuse.load(Ordering::SeqCst);
            if refuse > 0 {
                self.refuse.store(refuse - 1, Ordering::SeqCst);
                return Err(TransportError::Connect("refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.links.lock().unwrap().push(tx);
            Ok(FakeConn {
                rx,
                sent: Arc::clone(&self.sent),
                closed: Arc::clone(&self.closed),
            })
        }
    }

    impl Connection for FakeConn {
        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            match self.rx.recv().await {
                Some(Frame::Text(text)) => Some(Ok(text)),
                Some(Frame::Error) => Some(Err(TransportError::Io("connection reset".into()))),
                Some(Frame::Close) | None => None,
            }
        }

        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn manager(fake: &FakeConnector) -> ConnectionManager<FakeConnector> {
        ConnectionManager::new(fake.clone(), EventDispatcher::new())
    }

    fn collect(mgr: &ConnectionManager<FakeConnector>) -> (Arc<Mutex<Vec<Event>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sub = mgr
            .dispatcher()
            .subscribe(move |ev| s.lock().unwrap().push(ev.clone()));
        (seen, sub)
    }

    const PRICE_UPDATE: &str = r#"{"type":"az_price_update","az":"fr1","old_price":0.5,"new_price":0.6,"timestamp":"2024-01-01T00:00:00Z"}"#;

    // ── Policy ──────────────────────────────────────────────────────

    #[test]
    fn default_policy_is_fixed_three_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(3000));
        assert_eq!(policy.delay(7), Duration::from_millis(3000));
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(3));
        assert_eq!(policy.delay(1), Duration::from_secs(6));
        assert_eq!(policy.delay(3), Duration::from_secs(24));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn connect_opens_and_is_idempotent() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        mgr.connect();
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        mgr.connect();
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Open);

        mgr.connect();
        settle().await;
        assert_eq!(fake.attempts(), 1);
        assert_eq!(mgr.stats().connect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_subscribe_connects_implicitly() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        let _sub = mgr.subscribe(|_| {});
        let _sub2 = mgr.subscribe(|_| {});
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(fake.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_after_disconnect_stays_disconnected() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        mgr.disconnect();

        let _sub = mgr.subscribe(|_| {});
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(fake.attempts(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fake.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_pending_keeps_the_delay() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        fake.push(Frame::Error);
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::ReconnectPending);

        let _sub = mgr.subscribe(|_| {});
        settle().await;
        assert_eq!(fake.attempts(), 1);
        assert_eq!(mgr.state(), ConnectionState::ReconnectPending);
        assert!(mgr.has_pending_reconnect());

        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;
        assert_eq!(fake.attempts(), 2);
        assert_eq!(mgr.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_from_a_handler_stops_delivery_of_that_event() {
        let fake = FakeConnector::default();
        let mgr = Arc::new(manager(&fake));
        let handle: Arc<std::sync::OnceLock<std::sync::Weak<ConnectionManager<FakeConnector>>>> =
            Arc::default();

        let h = Arc::clone(&handle);
        let _closer = mgr.dispatcher().subscribe(move |_| {
            if let Some(mgr) = h.get().and_then(std::sync::Weak::upgrade) {
                mgr.disconnect();
            }
        });
        let (seen, _sub) = collect(&mgr);
        let _ = handle.set(Arc::downgrade(&mgr));

        mgr.connect();
        settle().await;
        fake.push(Frame::Text(PRICE_UPDATE.to_string()));
        settle().await;

        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(mgr.stats().events_dispatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_decoded_and_dispatched_in_order() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        let (seen, _sub) = collect(&mgr);
        mgr.connect();
        settle().await;

        fake.push(Frame::Text(PRICE_UPDATE.to_string()));
        fake.push(Frame::Text(
            r#"{"type":"brand_new","timestamp":"2024-01-01T00:00:01Z"}"#.to_string(),
        ));
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].kind, "az_price_update");
        assert_eq!(seen[1].kind, "brand_new");
        assert_eq!(mgr.stats().events_dispatched, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_is_dropped_and_connection_stays_open() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        let (seen, _sub) = collect(&mgr);
        mgr.connect();
        settle().await;

        fake.push(Frame::Text("definitely not json".to_string()));
        fake.push(Frame::Text(r#"{"type":"pong"}"#.to_string()));
        settle().await;

        assert_eq!(mgr.state(), ConnectionState::Open);
        assert!(seen.lock().unwrap().is_empty());
        assert!(!mgr.has_pending_reconnect());

        fake.push(Frame::Text(PRICE_UPDATE.to_string()));
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    // ── Reconnect ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn transport_error_triggers_exactly_one_reconnect() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Open);

        fake.push(Frame::Error);
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::ReconnectPending);
        assert!(mgr.has_pending_reconnect());
        assert_eq!(mgr.stats().reconnects_scheduled, 1);

        tokio::time::advance(Duration::from_millis(2999)).await;
        settle().await;
        assert_eq!(fake.attempts(), 1, "no attempt before the delay elapses");

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fake.attempts(), 2);
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert!(!mgr.has_pending_reconnect());

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(fake.attempts(), 2, "no further timers pending");
        assert_eq!(mgr.stats().reconnects_scheduled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_follows_same_path_as_error() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;

        fake.push(Frame::Close);
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::ReconnectPending);

        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(fake.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_close_while_pending_schedules_one_timer() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;

        fake.push(Frame::Error);
        settle().await;
        let generation = mgr.shared.machine().generation;

        for _ in 0..5 {
            mgr.shared
                .on_closed(generation, Some(TransportError::Io("again".into())));
            mgr.shared.on_closed(generation, None);
        }
        assert_eq!(mgr.stats().reconnects_scheduled, 1);

        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;
        assert_eq!(fake.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_on_fixed_cadence() {
        let fake = FakeConnector::default();
        fake.refuse_next(2);
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::ReconnectPending);

        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;
        assert_eq!(fake.attempts(), 2);
        assert_eq!(mgr.state(), ConnectionState::ReconnectPending);

        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;
        assert_eq!(fake.attempts(), 3);
        assert_eq!(mgr.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        fake.push(Frame::Error);
        settle().await;
        assert!(mgr.has_pending_reconnect());

        mgr.disconnect();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(!mgr.has_pending_reconnect());

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(fake.attempts(), 1);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_open_closes_socket_without_reconnect() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        let (seen, _sub) = collect(&mgr);
        mgr.connect();
        settle().await;

        mgr.disconnect();
        settle().await;
        assert_eq!(fake.closed.load(Ordering::SeqCst), 1);

        // The old link is dead: nothing it carries can reach subscribers.
        fake.push(Frame::Text(PRICE_UPDATE.to_string()));
        fake.push(Frame::Error);
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(fake.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_safe_in_every_state() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.disconnect();
        mgr.disconnect();
        mgr.connect();
        mgr.disconnect();
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_disconnect_reconnects() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        mgr.disconnect();
        mgr.connect();
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(fake.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_pending_skips_the_timer() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        fake.push(Frame::Error);
        settle().await;

        mgr.connect();
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(fake.attempts(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fake.attempts(), 2, "cancelled timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_are_observable() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        let rx = mgr.watch_state();
        mgr.connect();
        settle().await;
        assert_eq!(*rx.borrow(), ConnectionState::Open);
        fake.push(Frame::Error);
        settle().await;
        assert_eq!(*rx.borrow(), ConnectionState::ReconnectPending);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_sends_ping_while_open() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake).with_keepalive(Duration::from_secs(30));
        mgr.connect();
        settle().await;
        assert!(fake.sent.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(*fake.sent.lock().unwrap(), vec!["ping", "ping"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_policy_resets_after_open() {
        let fake = FakeConnector::default();
        fake.refuse_next(1);
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(8),
        };
        let mgr = ConnectionManager::with_policy(fake.clone(), EventDispatcher::new(), policy);
        mgr.connect();
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(mgr.shared.machine().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_disconnects() {
        let fake = FakeConnector::default();
        let mgr = manager(&fake);
        mgr.connect();
        settle().await;
        fake.push(Frame::Error);
        settle().await;
        drop(mgr);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fake.attempts(), 1);
    }
}
