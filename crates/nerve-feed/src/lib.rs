//! nerve-feed: push-channel side of the telemetry layer.
//!
//! [`EventDispatcher`] is a transport-free publish/subscribe bus.
//! [`ConnectionManager`] owns one logical push connection, reconnects on
//! unexpected close, and feeds decoded events into the dispatcher.

pub mod connection;
pub mod dispatcher;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionStats, ReconnectPolicy};
pub use dispatcher::{EventDispatcher, Subscription};
pub use nerve_core::{ConnectionState, Event, TransportError};
pub use transport::{Connection, Connector, WsConnector};
