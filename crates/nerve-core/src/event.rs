//! Push-channel events.
//!
//! Every inbound message is a JSON object with a string `type`, an ISO-8601
//! `timestamp` and type-specific fields. Unknown types are valid: they decode
//! into an [`Event`] like any other and are forwarded unfiltered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

// ─── Event ──────────────────────────────────────────────────────────

/// One decoded push message. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    /// All remaining fields, untouched.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            timestamp,
            payload: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn event_kind(&self) -> EventKind {
        EventKind::from_tag(&self.kind)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Typed view of the payload for the recognised event types.
    ///
    /// Returns `EventBody::Unknown` for tags this crate does not know; fails
    /// only when a recognised tag carries fields of the wrong shape.
    pub fn body(&self) -> Result<EventBody, DecodeError> {
        let payload = || Value::Object(self.payload.clone());
        let body = match self.event_kind() {
            EventKind::Connected => EventBody::Connected(serde_json::from_value(payload())?),
            EventKind::Pong => EventBody::Pong,
            EventKind::AzPriceUpdate => {
                EventBody::AzPriceUpdate(serde_json::from_value(payload())?)
            }
            EventKind::CheckpointEvent => {
                EventBody::CheckpointEvent(serde_json::from_value(payload())?)
            }
            EventKind::MigrationComplete => {
                EventBody::MigrationComplete(serde_json::from_value(payload())?)
            }
            EventKind::TimeshiftScheduled => {
                EventBody::TimeshiftScheduled(serde_json::from_value(payload())?)
            }
            EventKind::Unknown => EventBody::Unknown,
        };
        Ok(body)
    }
}

// ─── Kinds ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Pong,
    AzPriceUpdate,
    CheckpointEvent,
    MigrationComplete,
    TimeshiftScheduled,
    /// Any tag not listed above. Still delivered to subscribers.
    Unknown,
}

impl EventKind {
    pub const RECOGNISED: [Self; 6] = [
        Self::Connected,
        Self::Pong,
        Self::AzPriceUpdate,
        Self::CheckpointEvent,
        Self::MigrationComplete,
        Self::TimeshiftScheduled,
    ];

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "connected" => Self::Connected,
            "pong" => Self::Pong,
            "az_price_update" => Self::AzPriceUpdate,
            "checkpoint_event" => Self::CheckpointEvent,
            "migration_complete" => Self::MigrationComplete,
            "timeshift_scheduled" => Self::TimeshiftScheduled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Self::Connected => Some("connected"),
            Self::Pong => Some("pong"),
            Self::AzPriceUpdate => Some("az_price_update"),
            Self::CheckpointEvent => Some("checkpoint_event"),
            Self::MigrationComplete => Some("migration_complete"),
            Self::TimeshiftScheduled => Some("timeshift_scheduled"),
            Self::Unknown => None,
        }
    }
}

// ─── Bodies ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    Connected(Connected),
    Pong,
    AzPriceUpdate(AzPriceUpdate),
    CheckpointEvent(CheckpointEvent),
    MigrationComplete(MigrationComplete),
    TimeshiftScheduled(TimeshiftScheduled),
    Unknown,
}

/// Welcome message sent by the backend right after the upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connected {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub active_clients: Option<u64>,
    #[serde(default)]
    pub scraper_status: Option<Value>,
}

/// Spot price change detected for one SKU in one availability zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzPriceUpdate {
    #[serde(default)]
    pub instance: Option<String>,
    pub az: String,
    pub old_price: f64,
    pub new_price: f64,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl AzPriceUpdate {
    /// Relative change, e.g. `0.2` for 0.50 → 0.60. `None` if the old price is zero.
    pub fn change_ratio(&self) -> Option<f64> {
        if self.old_price == 0.0 {
            return None;
        }
        Some((self.new_price - self.old_price) / self.old_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub job_id: String,
    pub status: String,
    pub progress_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationComplete {
    pub job_id: String,
    pub from_az: String,
    pub to_az: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeshiftScheduled {
    pub job_id: String,
    pub estimated_savings_usd: f64,
}
