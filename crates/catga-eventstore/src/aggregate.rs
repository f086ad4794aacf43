//! Aggregates and their event-sourced repository.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use catga_core::{CatgaError, Result};

use crate::event::{DomainEvent, EventData};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store::EventStore;
use crate::upgrade::EventVersionRegistry;

/// Consistency boundary in event sourcing: state is the fold of the
/// stream. `execute` decides, `apply` folds.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync {
    const TYPE: &'static str;

    type Command;
    type Event: DomainEvent;
    type Error: std::error::Error + Send + Sync;

    fn execute(&self, command: Self::Command) -> std::result::Result<Vec<Self::Event>, Self::Error>;

    fn apply(&mut self, event: &Self::Event);
}

/// Loads, executes and persists aggregates: snapshot (if any) plus the
/// event tail, commands appended under optimistic concurrency.
pub struct AggregateRepository<A: Aggregate> {
    events: Arc<dyn EventStore>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    upgrades: Arc<EventVersionRegistry>,
    /// Snapshot roughly every N events; 0 disables snapshotting.
    snapshot_frequency: u64,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> AggregateRepository<A> {
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self {
            events,
            snapshots: None,
            upgrades: Arc::new(EventVersionRegistry::new()),
            snapshot_frequency: 0,
            _aggregate: PhantomData,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>, frequency: u64) -> Self {
        self.snapshots = Some(snapshots);
        self.snapshot_frequency = frequency;
        self
    }

    pub fn with_upgrades(mut self, upgrades: Arc<EventVersionRegistry>) -> Self {
        self.upgrades = upgrades;
        self
    }

    pub fn stream_id(aggregate_id: &str) -> String {
        format!("{}-{}", A::TYPE, aggregate_id)
    }

    /// Rebuild: snapshot prefix (when present), then fold the tail.
    /// Returns the state and its stream version (-1 when the aggregate
    /// does not exist yet).
    pub async fn load(&self, aggregate_id: &str) -> Result<(A, i64)> {
        let stream_id = Self::stream_id(aggregate_id);

        let (mut state, mut version) = match &self.snapshots {
            Some(snapshots) => match snapshots.load(&stream_id).await? {
                Some(snapshot) => (snapshot.decode::<A>()?, snapshot.version),
                None => (A::default(), -1),
            },
            None => (A::default(), -1),
        };

        let stream = self.events.read(&stream_id, (version + 1) as u64).await?;
        for mut stored in stream.events {
            self.upgrades.upgrade_to_latest(&mut stored)?;
            let event: A::Event = stored.decode()?;
            state.apply(&event);
            version = stored.version as i64;
        }
        Ok((state, version))
    }

    /// Load, run the command, append the produced events with the
    /// loaded version as CAS token, then fold them into the state.
    pub async fn execute(&self, aggregate_id: &str, command: A::Command) -> Result<(A, i64)> {
        let (mut state, version) = self.load(aggregate_id).await?;

        let events = state
            .execute(command)
            .map_err(|e| CatgaError::handler(e.to_string()))?;
        if events.is_empty() {
            return Ok((state, version));
        }

        let data = events
            .iter()
            .map(EventData::from_event)
            .collect::<Result<Vec<_>>>()?;
        let stream_id = Self::stream_id(aggregate_id);
        let new_version = self.events.append(&stream_id, data, Some(version)).await?;

        for event in &events {
            state.apply(event);
        }

        self.maybe_snapshot(&stream_id, &state, new_version).await;
        Ok((state, new_version))
    }

    async fn maybe_snapshot(&self, stream_id: &str, state: &A, version: i64) {
        let Some(snapshots) = &self.snapshots else { return };
        if self.snapshot_frequency == 0 || version < 0 {
            return;
        }
        // Frequency is a hint: snapshot whenever the version crosses a
        // multiple of it.
        if (version as u64 + 1) % self.snapshot_frequency != 0 {
            return;
        }
        match Snapshot::capture(stream_id, state, version) {
            Ok(snapshot) => {
                if let Err(e) = snapshots.save(snapshot).await {
                    debug!(stream_id, error = %e, "snapshot save failed");
                }
            }
            Err(e) => debug!(stream_id, error = %e, "snapshot encode failed"),
        }
    }
}
