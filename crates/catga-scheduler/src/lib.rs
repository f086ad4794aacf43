//! Delayed delivery: messages persisted with a due time and dispatched
//! by a polling loop.
//!
//! Delivery is at-least-once: a crash between dispatch and
//! `mark_delivered` re-delivers the message on the next poll, so
//! consumers dedup via the inbox or idempotency store.

mod poller;
mod store;

pub use poller::{SchedulePoller, SchedulePollerConfig};
pub use store::{
    InMemorySchedulerStore, ScheduleStatus, ScheduledMessage, SchedulerStore,
};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};

use catga_core::Result;

/// Handle returned by [`MessageScheduler::schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    pub schedule_id: String,
    pub message_type: String,
}

/// Facade over a [`SchedulerStore`]: schedule, cancel, inspect.
pub struct MessageScheduler {
    store: Arc<dyn SchedulerStore>,
}

impl MessageScheduler {
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    /// Persist a message for delivery after `delay`.
    pub async fn schedule_in(
        &self,
        message_type: impl Into<String>,
        payload: Bytes,
        delay: Duration,
    ) -> Result<ScheduleHandle> {
        let deliver_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.schedule_at(message_type, payload, deliver_at).await
    }

    /// Persist a message for delivery at an absolute time.
    pub async fn schedule_at(
        &self,
        message_type: impl Into<String>,
        payload: Bytes,
        deliver_at: DateTime<Utc>,
    ) -> Result<ScheduleHandle> {
        let message = ScheduledMessage::new(message_type, payload, deliver_at);
        let handle = ScheduleHandle {
            schedule_id: message.schedule_id.clone(),
            message_type: message.message_type.clone(),
        };
        self.store.insert(message).await?;
        metrics::counter!("catga.scheduler.scheduled_total").increment(1);
        Ok(handle)
    }

    /// Cancel a Pending schedule. Returns false when it was already
    /// delivered or cancelled.
    pub async fn cancel(&self, schedule_id: &str) -> Result<bool> {
        self.store.cancel(schedule_id).await
    }

    pub async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledMessage>> {
        self.store.get(schedule_id).await
    }

    pub async fn list_pending(&self, limit: usize) -> Result<Vec<ScheduledMessage>> {
        self.store.list_pending(limit).await
    }

    /// Pending schedules as an async sequence.
    pub async fn pending_stream(
        &self,
        limit: usize,
    ) -> Result<impl Stream<Item = ScheduledMessage>> {
        Ok(stream::iter(self.store.list_pending(limit).await?))
    }
}
