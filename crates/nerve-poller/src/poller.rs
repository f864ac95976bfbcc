//! Snapshot poller.
//!
//! Each registered domain gets a scheduler task ticking every `interval`
//! from registration time. A tick starts a fetch only if none is in flight
//! for that domain; otherwise the tick is skipped, never queued.
//!
//! Results are applied only if the task that started the fetch is still
//! registered (checked by task id), so a fetch that outlives `stop()` or a
//! re-registration of the same domain is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use nerve_core::{DomainId, FetchError, RegistrationError};

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Value, FetchError>> + Send>>;

type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

// ─── Public types ───────────────────────────────────────────────────

/// Returned by `register`; identifies one poll task (not just its domain).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollHandle {
    domain: DomainId,
    id: u64,
}

impl PollHandle {
    pub fn domain(&self) -> &DomainId {
        &self.domain
    }
}

/// Latest successfully fetched value for one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub domain: DomainId,
    pub value: Value,
    /// Wall-clock completion time, for display.
    pub fetched_at: DateTime<Utc>,
    /// Monotonic completion time, for staleness.
    pub fetched_instant: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollCounters {
    pub fetches_started: u64,
    pub fetches_skipped: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// No successful fetch yet.
    Pending,
    Fresh,
    Stale,
}

/// Point-in-time copy of one poll task's state.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainStatus {
    pub domain: DomainId,
    pub interval: Duration,
    pub in_flight: bool,
    pub snapshot: Option<Snapshot>,
    pub last_error: Option<FetchError>,
    pub counters: PollCounters,
}

impl DomainStatus {
    pub fn is_stale(&self, now: Instant) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|s| is_stale(s.fetched_instant, self.interval, now))
    }

    pub fn freshness(&self, now: Instant) -> Freshness {
        match &self.snapshot {
            None => Freshness::Pending,
            Some(s) if is_stale(s.fetched_instant, self.interval, now) => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }
}

/// A value is stale once `now - fetched >= 2 * interval`.
pub fn is_stale(fetched: Instant, interval: Duration, now: Instant) -> bool {
    now.saturating_duration_since(fetched) >= interval.saturating_mul(2)
}

// ─── Internal state ─────────────────────────────────────────────────

struct PollTask {
    id: u64,
    interval: Duration,
    fetch: FetchFn,
    in_flight: bool,
    snapshot: Option<Snapshot>,
    last_error: Option<FetchError>,
    counters: PollCounters,
    cancel: CancellationToken,
}

impl PollTask {
    fn status(&self, domain: &DomainId) -> DomainStatus {
        DomainStatus {
            domain: domain.clone(),
            interval: self.interval,
            in_flight: self.in_flight,
            snapshot: self.snapshot.clone(),
            last_error: self.last_error.clone(),
            counters: self.counters,
        }
    }
}

struct Shared {
    tasks: Mutex<HashMap<DomainId, PollTask>>,
    next_id: AtomicU64,
    revision: watch::Sender<u64>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for task in tasks.values() {
            task.cancel.cancel();
        }
    }
}

// ─── SnapshotPoller ─────────────────────────────────────────────────

/// Registry of poll tasks. Cheap to clone; clones share tasks.
///
/// Must be used from inside a tokio runtime. Scheduler tasks hold only a
/// weak reference, so dropping the last clone stops all polling.
#[derive(Clone)]
pub struct SnapshotPoller {
    shared: Arc<Shared>,
}

impl Default for SnapshotPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPoller {
    pub fn new() -> Self {
        let (revision, _rx) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                revision,
            }),
        }
    }

    /// Register `domain`: fetch now, then every `interval` measured from now.
    ///
    /// Fails on a zero interval or when `domain` already has a live task.
    pub fn register<F, Fut>(
        &self,
        domain: impl Into<DomainId>,
        fetch: F,
        interval: Duration,
    ) -> Result<PollHandle, RegistrationError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let domain = domain.into();
        if interval.is_zero() {
            return Err(RegistrationError::InvalidInterval(interval));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut tasks = self.shared.tasks();
            if tasks.contains_key(&domain) {
                return Err(RegistrationError::DuplicateDomain(domain));
            }
            let fetch: FetchFn = Arc::new(move || -> FetchFuture { Box::pin(fetch()) });
            tasks.insert(
                domain.clone(),
                PollTask {
                    id,
                    interval,
                    fetch,
                    in_flight: false,
                    snapshot: None,
                    last_error: None,
                    counters: PollCounters::default(),
                    cancel: cancel.clone(),
                },
            );
        }
        tracing::info!(
            domain = %domain,
            interval_ms = interval.as_millis() as u64,
            "poller: domain registered"
        );

        let weak = Arc::downgrade(&self.shared);
        let scheduled = domain.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        shared.start_fetch(&scheduled, id);
                    }
                }
            }
        });

        Ok(PollHandle { domain, id })
    }

    /// Cancel future fetches for the handle's task. A fetch already in
    /// flight finishes but its result is dropped. Returns `false` if the
    /// task was already stopped.
    pub fn stop(&self, handle: &PollHandle) -> bool {
        let removed = {
            let mut tasks = self.shared.tasks();
            match tasks.get(&handle.domain) {
                Some(task) if task.id == handle.id => tasks.remove(&handle.domain),
                _ => None,
            }
        };
        let Some(task) = removed else {
            return false;
        };
        task.cancel.cancel();
        tracing::info!(domain = %handle.domain, in_flight = task.in_flight, "poller: domain stopped");
        self.shared.bump_revision();
        true
    }

    /// Start an out-of-schedule fetch. Skipped (returns `false`) if one is
    /// already in flight or the task is stopped. The schedule is unchanged.
    pub fn refresh(&self, handle: &PollHandle) -> bool {
        self.shared.start_fetch(&handle.domain, handle.id)
    }

    pub fn snapshot(&self, domain: &DomainId) -> Option<Snapshot> {
        self.shared
            .tasks()
            .get(domain)
            .and_then(|task| task.snapshot.clone())
    }

    pub fn status(&self, domain: &DomainId) -> Option<DomainStatus> {
        self.shared
            .tasks()
            .get(domain)
            .map(|task| task.status(domain))
    }

    /// Status of every registered domain, taken under one lock, sorted by domain.
    pub fn statuses(&self) -> Vec<DomainStatus> {
        let mut all: Vec<DomainStatus> = self
            .shared
            .tasks()
            .iter()
            .map(|(domain, task)| task.status(domain))
            .collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        all
    }

    /// `None` if the domain is not registered.
    pub fn is_stale(&self, domain: &DomainId) -> Option<bool> {
        self.status(domain).map(|s| s.is_stale(Instant::now()))
    }

    pub fn domains(&self) -> Vec<DomainId> {
        let mut domains: Vec<DomainId> = self.shared.tasks().keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Bumped every time a result is applied or a task is stopped.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

impl std::fmt::Debug for SnapshotPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPoller")
            .field("domains", &self.domains())
            .finish()
    }
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<DomainId, PollTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn start_fetch(self: &Arc<Self>, domain: &DomainId, id: u64) -> bool {
        let fetch = {
            let mut tasks = self.tasks();
            let Some(task) = tasks.get_mut(domain).filter(|t| t.id == id) else {
                return false;
            };
            if task.in_flight {
                task.counters.fetches_skipped += 1;
                tracing::debug!(domain = %domain, "poller: previous fetch still in flight, skipping");
                return false;
            }
            task.in_flight = true;
            task.counters.fetches_started += 1;
            Arc::clone(&task.fetch)
        };

        let weak = Arc::downgrade(self);
        let domain = domain.clone();
        tokio::spawn(async move {
            // A panicking fetch surfaces here as a JoinError and is recorded
            // like any other failure, so `in_flight` is always cleared.
            let result = match tokio::spawn(async move { fetch().await }).await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Task(e.to_string())),
            };
            if let Some(shared) = weak.upgrade() {
                shared.complete(&domain, id, result);
            }
        });
        true
    }

    fn complete(&self, domain: &DomainId, id: u64, result: Result<Value, FetchError>) {
        {
            let mut tasks = self.tasks();
            let Some(task) = tasks.get_mut(domain).filter(|t| t.id == id) else {
                tracing::debug!(domain = %domain, "poller: discarding result of stopped task");
                return;
            };
            task.in_flight = false;
            match result {
                Ok(value) => {
                    task.snapshot = Some(Snapshot {
                        domain: domain.clone(),
                        value,
                        fetched_at: Utc::now(),
                        fetched_instant: Instant::now(),
                    });
                    task.last_error = None;
                }
                Err(e) => {
                    tracing::warn!(domain = %domain, error = %e, "poller: fetch failed, keeping previous value");
                    task.counters.failures += 1;
                    task.last_error = Some(e);
                }
            }
        }
        self.bump_revision();
    }
}
