//! Schedule persistence.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use catga_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Pending,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub schedule_id: String,
    pub message_type: String,
    pub payload: Bytes,
    pub deliver_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(message_type: impl Into<String>, payload: Bytes, deliver_at: DateTime<Utc>) -> Self {
        Self {
            schedule_id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            payload,
            deliver_at,
            status: ScheduleStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn insert(&self, message: ScheduledMessage) -> Result<()>;

    /// Cancel a Pending schedule; Delivered/Cancelled rows are left
    /// untouched and report false.
    async fn cancel(&self, schedule_id: &str) -> Result<bool>;

    async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledMessage>>;

    /// Pending rows ordered by due time.
    async fn list_pending(&self, limit: usize) -> Result<Vec<ScheduledMessage>>;

    /// Pending rows due at or before `now`, ordered by due time.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>>;

    async fn mark_delivered(&self, schedule_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySchedulerStore {
    rows: DashMap<String, ScheduledMessage>,
}

impl InMemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending_sorted(&self, limit: usize, cutoff: Option<DateTime<Utc>>) -> Vec<ScheduledMessage> {
        let mut rows: Vec<ScheduledMessage> = self
            .rows
            .iter()
            .filter(|r| r.status == ScheduleStatus::Pending)
            .filter(|r| cutoff.map(|c| r.deliver_at <= c).unwrap_or(true))
            .map(|r| r.clone())
            .collect();
        rows.sort_by_key(|r| r.deliver_at);
        rows.truncate(limit);
        rows
    }
}

#[async_trait]
impl SchedulerStore for InMemorySchedulerStore {
    async fn insert(&self, message: ScheduledMessage) -> Result<()> {
        self.rows.insert(message.schedule_id.clone(), message);
        Ok(())
    }

    async fn cancel(&self, schedule_id: &str) -> Result<bool> {
        match self.rows.get_mut(schedule_id) {
            Some(mut row) if row.status == ScheduleStatus::Pending => {
                row.status = ScheduleStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledMessage>> {
        Ok(self.rows.get(schedule_id).map(|r| r.clone()))
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<ScheduledMessage>> {
        Ok(self.pending_sorted(limit, None))
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>> {
        Ok(self.pending_sorted(limit, Some(now)))
    }

    async fn mark_delivered(&self, schedule_id: &str) -> Result<()> {
        if let Some(mut row) = self.rows.get_mut(schedule_id) {
            row.status = ScheduleStatus::Delivered;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_ms(ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[tokio::test]
    async fn due_returns_only_ripe_pending_rows() {
        let store = InMemorySchedulerStore::new();
        let ripe = ScheduledMessage::new("A", Bytes::new(), in_ms(-100));
        let ripe_id = ripe.schedule_id.clone();
        let future = ScheduledMessage::new("B", Bytes::new(), in_ms(60_000));
        store.insert(ripe).await.unwrap();
        store.insert(future).await.unwrap();

        let due = store.due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].schedule_id, ripe_id);

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn cancel_only_affects_pending() {
        let store = InMemorySchedulerStore::new();
        let message = ScheduledMessage::new("A", Bytes::new(), in_ms(-1));
        let id = message.schedule_id.clone();
        store.insert(message).await.unwrap();

        assert!(store.cancel(&id).await.unwrap());
        assert!(!store.cancel(&id).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, ScheduleStatus::Cancelled);
        assert!(store.due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivered_rows_leave_the_pending_set() {
        let store = InMemorySchedulerStore::new();
        let message = ScheduledMessage::new("A", Bytes::new(), in_ms(-1));
        let id = message.schedule_id.clone();
        store.insert(message).await.unwrap();

        store.mark_delivered(&id).await.unwrap();
        assert!(store.due(Utc::now(), 10).await.unwrap().is_empty());
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, ScheduleStatus::Delivered);
    }
}
