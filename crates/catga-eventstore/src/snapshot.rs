//! Snapshots: cached fold prefixes keyed by event-stream version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use catga_core::Result;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub stream_id: String,
    pub state: serde_json::Value,
    /// The event-stream version this state summarizes.
    pub version: i64,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn capture<S: Serialize>(stream_id: &str, state: &S, version: i64) -> Result<Self> {
        Ok(Self {
            stream_id: stream_id.to_string(),
            state: serde_json::to_value(state)?,
            version,
            captured_at: Utc::now(),
        })
    }

    pub fn decode<S: DeserializeOwned>(&self) -> Result<S> {
        Ok(serde_json::from_value(self.state.clone())?)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Overwrites any prior snapshot for the stream.
    async fn save(&self, snapshot: Snapshot) -> Result<()>;

    async fn load(&self, stream_id: &str) -> Result<Option<Snapshot>>;

    async fn delete(&self, stream_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<String, Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        self.snapshots.insert(snapshot.stream_id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, stream_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.get(stream_id).map(|s| s.clone()))
    }

    async fn delete(&self, stream_id: &str) -> Result<()> {
        self.snapshots.remove(stream_id);
        Ok(())
    }
}
