//! Event sourcing: append-with-version event log, snapshots, schema
//! upgraders and time-travel reconstruction.

pub mod aggregate;
pub mod event;
pub mod snapshot;
pub mod store;
pub mod time_travel;
pub mod upgrade;

pub use aggregate::{Aggregate, AggregateRepository};
pub use event::{DomainEvent, EventData, EventStream, StoredEvent};
pub use snapshot::{InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use store::{EventStore, InMemoryEventStore};
pub use time_travel::{TimeTravel, VersionComparison, VersionHistoryEntry};
pub use upgrade::{EventUpgrader, EventVersionRegistry};
