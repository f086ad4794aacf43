//! Append-only event log with optimistic concurrency.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use catga_core::{CatgaError, Result};

use crate::event::{EventData, EventStream, StoredEvent};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` contiguously. With `expected_version`, fails
    /// with a concurrency conflict unless it equals the current stream
    /// version (-1 for a stream that does not exist). Without it, the
    /// append is last-writer; callers wanting safety pass the version.
    /// Returns the stream version after the append.
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventData>,
        expected_version: Option<i64>,
    ) -> Result<i64>;

    /// Events ordered by version, starting at `from_version`.
    async fn read(&self, stream_id: &str, from_version: u64) -> Result<EventStream>;

    /// Current stream version: -1 for a non-existent stream, otherwise
    /// the version of the last event.
    async fn version(&self, stream_id: &str) -> Result<i64>;
}

#[derive(Default)]
pub struct InMemoryEventStore {
    streams: DashMap<String, Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventData>,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        if events.is_empty() {
            return self.version(stream_id).await;
        }

        // The entry guard serializes appends per stream, making the
        // version check and the append one atomic step.
        let mut stream = self.streams.entry(stream_id.to_string()).or_default();
        let current = stream.last().map(|e| e.version as i64).unwrap_or(-1);

        if let Some(expected) = expected_version {
            if expected != current {
                return Err(CatgaError::ConcurrencyConflict {
                    resource: stream_id.to_string(),
                    expected,
                    actual: current,
                });
            }
        }

        let appended_at = Utc::now();
        let mut version = current;
        for event in events {
            version += 1;
            stream.push(StoredEvent {
                stream_id: stream_id.to_string(),
                version: version as u64,
                event_type: event.event_type,
                schema_version: event.schema_version,
                payload: event.payload,
                appended_at,
            });
        }
        Ok(version)
    }

    async fn read(&self, stream_id: &str, from_version: u64) -> Result<EventStream> {
        let events = self
            .streams
            .get(stream_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(EventStream { stream_id: stream_id.to_string(), events })
    }

    async fn version(&self, stream_id: &str) -> Result<i64> {
        Ok(self
            .streams
            .get(stream_id)
            .and_then(|stream| stream.last().map(|e| e.version as i64))
            .unwrap_or(-1))
    }
}
