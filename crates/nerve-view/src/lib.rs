//! nerve-view: the single read model the presentation layer consumes.
//!
//! [`ViewAggregator`] merges the push feed (a bounded, newest-first event
//! log) with the poller's per-domain snapshots into one [`AggregateView`].

pub mod aggregator;
pub mod event_log;

pub use aggregator::{AggregateView, DomainView, ViewAggregator, ViewWatcher};
pub use event_log::{EventLog, RECENT_EVENTS_CAPACITY};
