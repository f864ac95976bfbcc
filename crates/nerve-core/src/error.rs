//! Error taxonomy for the telemetry layer.
//!
//! Only [`RegistrationError`] is meant to reach calling code. The others are
//! absorbed by the component that produces them and turned into observable
//! state (connection status, per-domain error flag).

use std::time::Duration;

use thiserror::Error;

use crate::state::DomainId;

/// Connection-level failure on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("socket io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A single push message that could not be turned into an `Event`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of one poll cycle for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("backend returned status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response body: {0}")]
    Decode(String),

    /// The fetch task panicked or was cancelled.
    #[error("fetch task failed: {0}")]
    Task(String),
}

/// Invalid poll task registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("poll interval must be positive, got {0:?}")]
    InvalidInterval(Duration),

    #[error("domain already registered: {0}")]
    DuplicateDomain(DomainId),
}
