//! nerve-core: data model shared by the live telemetry layer.
//! Push-channel events, connection state, polled domain ids and the error
//! taxonomy. No IO, no async.

pub mod error;
pub mod event;
pub mod state;

pub use error::{DecodeError, FetchError, RegistrationError, TransportError};
pub use event::{
    AzPriceUpdate, CheckpointEvent, Connected, Event, EventBody, EventKind, MigrationComplete,
    TimeshiftScheduled,
};
pub use state::{ConnectionState, DomainId};
