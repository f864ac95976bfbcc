//! View aggregator: push events + polled snapshots → one read model.
//!
//! Reads are pull-based ([`ViewAggregator::view`]) with an optional push
//! notification ([`ViewAggregator::watch`]). Every view is built from one
//! copy of the event log and one copy of all domain statuses, each taken
//! under its own lock, so no half-applied update is ever visible.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use nerve_core::{ConnectionState, DomainId, Event};
use nerve_feed::{EventDispatcher, Subscription};
use nerve_poller::{DomainStatus, Freshness, PollCounters, SnapshotPoller};

use crate::event_log::EventLog;

// ─── View types ─────────────────────────────────────────────────────

/// One domain as seen by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainView {
    /// Last successfully fetched value; `None` until the first success.
    pub value: Option<Value>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub freshness: Freshness,
    pub in_flight: bool,
    pub last_error: Option<String>,
    pub interval_ms: u64,
    pub counters: PollCounters,
}

impl DomainView {
    fn from_status(status: DomainStatus, now: Instant) -> Self {
        let stale = status.is_stale(now);
        let freshness = status.freshness(now);
        let (value, fetched_at) = match status.snapshot {
            Some(snapshot) => (Some(snapshot.value), Some(snapshot.fetched_at)),
            None => (None, None),
        };
        Self {
            value,
            fetched_at,
            stale,
            freshness,
            in_flight: status.in_flight,
            last_error: status.last_error.map(|e| e.to_string()),
            interval_ms: duration_ms(status.interval),
            counters: status.counters,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Merged, read-only view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateView {
    /// Registered domains only; a stopped domain is absent.
    pub snapshots: BTreeMap<DomainId, DomainView>,
    /// Newest first.
    pub recent_events: Vec<Event>,
    /// `None` when no connection state source was attached.
    pub connection: Option<ConnectionState>,
    pub generated_at: DateTime<Utc>,
}

impl AggregateView {
    pub fn snapshot(&self, domain: &DomainId) -> Option<&DomainView> {
        self.snapshots.get(domain)
    }

    /// True once every registered domain has had a successful fetch.
    pub fn is_filled(&self) -> bool {
        self.snapshots.values().all(|d| d.value.is_some())
    }
}

// ─── Aggregator ─────────────────────────────────────────────────────

struct Inner {
    events: Mutex<EventLog>,
    poller: SnapshotPoller,
    connection: Mutex<Option<watch::Receiver<ConnectionState>>>,
    event_revision: watch::Sender<u64>,
}

impl Inner {
    fn events(&self) -> MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> MutexGuard<'_, Option<watch::Receiver<ConnectionState>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_event(&self, event: &Event) {
        self.events().push(event.clone());
        self.event_revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn view(&self) -> AggregateView {
        let recent_events = self.events().to_vec();
        let connection = self.connection().as_ref().map(|rx| *rx.borrow());
        let now = Instant::now();
        let snapshots = self
            .poller
            .statuses()
            .into_iter()
            .map(|status| (status.domain.clone(), DomainView::from_status(status, now)))
            .collect();
        AggregateView {
            snapshots,
            recent_events,
            connection,
            generated_at: Utc::now(),
        }
    }
}

/// Owns one dispatcher subscription for its whole life. Dropping the
/// aggregator unsubscribes.
pub struct ViewAggregator {
    inner: Arc<Inner>,
    subscription: Subscription,
}

impl ViewAggregator {
    pub fn new(dispatcher: &EventDispatcher, poller: SnapshotPoller) -> Self {
        Self::with_log(dispatcher, poller, EventLog::new())
    }

    /// Use a custom event log (e.g. a different capacity).
    pub fn with_log(dispatcher: &EventDispatcher, poller: SnapshotPoller, log: EventLog) -> Self {
        let (event_revision, _rx) = watch::channel(0);
        let inner = Arc::new(Inner {
            events: Mutex::new(log),
            poller,
            connection: Mutex::new(None),
            event_revision,
        });
        let sink = Arc::clone(&inner);
        let subscription = dispatcher.subscribe(move |event| sink.on_event(event));
        tracing::debug!("view: subscribed to event dispatcher");
        Self {
            inner,
            subscription,
        }
    }

    /// Include the connection status (from
    /// [`ConnectionManager::watch_state`](nerve_feed::ConnectionManager::watch_state))
    /// in every view.
    #[must_use]
    pub fn with_connection_state(self, state: watch::Receiver<ConnectionState>) -> Self {
        *self.inner.connection() = Some(state);
        self
    }

    pub fn view(&self) -> AggregateView {
        self.inner.view()
    }

    pub fn recent_events(&self) -> Vec<Event> {
        self.inner.events().to_vec()
    }

    pub fn poller(&self) -> &SnapshotPoller {
        &self.inner.poller
    }

    /// A watcher that wakes on every appended event, applied snapshot,
    /// stopped domain or connection state change.
    pub fn watch(&self) -> ViewWatcher {
        ViewWatcher {
            inner: Arc::clone(&self.inner),
            events: self.inner.event_revision.subscribe(),
            snapshots: self.inner.poller.subscribe_changes(),
            connection: self.inner.connection().clone(),
        }
    }
}

impl Drop for ViewAggregator {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl std::fmt::Debug for ViewAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewAggregator")
            .field("events", &self.inner.events().len())
            .field("poller", &self.inner.poller)
            .finish()
    }
}

// ─── Watcher ────────────────────────────────────────────────────────

enum Wake {
    Changed,
    ConnectionGone,
    Closed,
}

pub struct ViewWatcher {
    inner: Arc<Inner>,
    events: watch::Receiver<u64>,
    snapshots: watch::Receiver<u64>,
    connection: Option<watch::Receiver<ConnectionState>>,
}

impl ViewWatcher {
    /// Wait for the next change and return a fresh view. Changes that
    /// happened since the previous call coalesce into one wake-up.
    /// Returns `None` once no source can change any more.
    pub async fn changed(&mut self) -> Option<AggregateView> {
        loop {
            let Self {
                events,
                snapshots,
                connection,
                ..
            } = self;
            let connection_changed = async {
                match connection.as_mut() {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            };
            let wake = tokio::select! {
                r = events.changed() => if r.is_ok() { Wake::Changed } else { Wake::Closed },
                r = snapshots.changed() => if r.is_ok() { Wake::Changed } else { Wake::Closed },
                r = connection_changed => if r.is_ok() { Wake::Changed } else { Wake::ConnectionGone },
            };
            match wake {
                Wake::Changed => break,
                Wake::ConnectionGone => self.connection = None,
                Wake::Closed => return None,
            }
        }
        self.events.borrow_and_update();
        self.snapshots.borrow_and_update();
        if let Some(rx) = self.connection.as_mut() {
            rx.borrow_and_update();
        }
        Some(self.inner.view())
    }

    /// Current view without waiting.
    pub fn view(&self) -> AggregateView {
        self.inner.view()
    }
}
