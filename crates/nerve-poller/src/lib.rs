//! nerve-poller: recurring snapshot fetches, one task per data domain.
//!
//! [`SnapshotPoller`] runs each registered fetch function on a fixed
//! schedule with at most one fetch in flight per domain. [`BackendClient`]
//! builds fetch functions for the backend's pull endpoints.

pub mod backend;
pub mod domains;
pub mod poller;

pub use backend::{BackendClient, Endpoint};
pub use domains::{PriceCurve, PricePoint, RegionSummary};
pub use poller::{
    DomainStatus, FetchFuture, Freshness, PollCounters, PollHandle, Snapshot, SnapshotPoller,
    is_stale,
};
