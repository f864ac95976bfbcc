//! In-process fan-out of push events.
//!
//! `dispatch` works on a copy of the subscriber list taken when it starts,
//! so handlers may subscribe or unsubscribe (themselves or others) while
//! the event is being delivered:
//! - a subscriber added during a dispatch does not see the in-flight event;
//! - a subscriber removed during a dispatch is not called later in it.
//!
//! No buffering happens here; history belongs to the view layer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use nerve_core::Event;

type Callback = dyn Fn(&Event) + Send + Sync;

struct Subscriber {
    id: u64,
    active: AtomicBool,
    callback: Box<Callback>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

impl Registry {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Publish/subscribe bus for [`Event`]s. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`; it is called for every later dispatch, in
    /// registration order, until the returned subscription is revoked.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });
        self.registry.subscribers().push(Arc::clone(&subscriber));
        Subscription {
            subscriber,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every subscriber registered when this call begins.
    ///
    /// The subscriber lock is not held while callbacks run.
    pub fn dispatch(&self, event: &Event) {
        self.dispatch_while(event, || true);
    }

    /// Like [`dispatch`](Self::dispatch), but `keep_going` is checked before
    /// each callback and delivery stops at the first `false`.
    pub fn dispatch_while(&self, event: &Event, keep_going: impl Fn() -> bool) {
        let snapshot: Vec<Arc<Subscriber>> = self.registry.subscribers().clone();
        for subscriber in &snapshot {
            if !keep_going() {
                return;
            }
            if subscriber.active.load(Ordering::Acquire) {
                (subscriber.callback)(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers().len()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle pairing one callback with its dispatcher.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Remove the callback. Safe to call any number of times, from any
    /// context including the callback itself.
    pub fn unsubscribe(&self) {
        if !self.subscriber.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let id = self.subscriber.id;
            registry.subscribers().retain(|s| s.id != id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscriber.id)
            .field("active", &self.is_active())
            .finish()
    }
}
