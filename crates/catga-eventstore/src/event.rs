//! Domain events and their stored form.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A fact recorded in an event stream. Events are immutable once
/// appended; schema evolution happens through upgraders on read.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    fn event_type(&self) -> &'static str;

    /// Schema version of this event type as currently written.
    fn event_version(&self) -> u16 {
        1
    }
}

/// Payload handed to the store for appending: everything except the
/// stream position, which the store assigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub event_type: String,
    pub schema_version: u16,
    pub payload: serde_json::Value,
}

impl EventData {
    pub fn from_event<E: DomainEvent>(event: &E) -> catga_core::Result<Self> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            schema_version: event.event_version(),
            payload: serde_json::to_value(event)?,
        })
    }
}

/// One persisted event at a dense, zero-based stream position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub stream_id: String,
    pub version: u64,
    pub event_type: String,
    pub schema_version: u16,
    pub payload: serde_json::Value,
    pub appended_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn decode<E: DomainEvent>(&self) -> catga_core::Result<E> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Ordered slice of a stream.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    pub stream_id: String,
    pub events: Vec<StoredEvent>,
}

impl EventStream {
    /// Version of the last event in this slice, -1 when empty.
    pub fn last_version(&self) -> i64 {
        self.events.last().map(|e| e.version as i64).unwrap_or(-1)
    }
}
