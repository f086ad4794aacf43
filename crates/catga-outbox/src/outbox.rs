//! Durable send-queue co-located with business state.
//!
//! Producers append a Pending row in the same unit of work as their
//! state change; the relay publishes Pending rows and marks them
//! Published. Failed is terminal: rows land there only after retries
//! are exhausted, Pending rows carry the retry count until then.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use catga_core::{MessageId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Bytes,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn new(message_id: MessageId, message_type: impl Into<String>, payload: Bytes) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a Pending row.
    async fn add(&self, message: OutboxMessage) -> Result<()>;

    /// Pending rows ordered by creation time, oldest first.
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Pending → Published. Idempotent: marking twice equals once.
    async fn mark_published(&self, message_id: MessageId) -> Result<()>;

    /// Record a publish failure: increments the retry count, keeps the
    /// row Pending for the next poll. Returns the new retry count.
    async fn mark_failed(&self, message_id: MessageId, reason: &str) -> Result<u32>;

    /// Terminal failure after retry exhaustion; the row stops being
    /// returned by `get_pending`.
    async fn mark_abandoned(&self, message_id: MessageId) -> Result<()>;

    /// Retention: delete Published rows older than the cutoff. Returns
    /// how many rows were removed.
    async fn sweep_published(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// DashMap-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryOutbox {
    rows: DashMap<MessageId, OutboxMessage>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, message_id: MessageId) -> Option<OutboxMessage> {
        self.rows.get(&message_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn add(&self, message: OutboxMessage) -> Result<()> {
        self.rows.insert(message.message_id, message);
        Ok(())
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let mut pending: Vec<OutboxMessage> = self
            .rows
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .map(|r| r.clone())
            .collect();
        pending.sort_by_key(|m| (m.created_at, m.message_id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, message_id: MessageId) -> Result<()> {
        if let Some(mut row) = self.rows.get_mut(&message_id) {
            row.status = OutboxStatus::Published;
        }
        Ok(())
    }

    async fn mark_failed(&self, message_id: MessageId, reason: &str) -> Result<u32> {
        if let Some(mut row) = self.rows.get_mut(&message_id) {
            row.retry_count += 1;
            row.last_error = Some(reason.to_string());
            Ok(row.retry_count)
        } else {
            Ok(0)
        }
    }

    async fn mark_abandoned(&self, message_id: MessageId) -> Result<()> {
        if let Some(mut row) = self.rows.get_mut(&message_id) {
            row.status = OutboxStatus::Failed;
        }
        Ok(())
    }

    async fn sweep_published(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let before = self.rows.len();
        self.rows
            .retain(|_, row| !(row.status == OutboxStatus::Published && row.created_at < older_than));
        Ok(before - self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(payload: &'static [u8]) -> OutboxMessage {
        OutboxMessage::new(MessageId::next(), "TestEvent", Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn pending_rows_come_back_oldest_first() {
        let store = InMemoryOutbox::new();
        let first = msg(b"1");
        let second = msg(b"2");
        let first_id = first.message_id;

        store.add(first).await.unwrap();
        store.add(second).await.unwrap();

        let pending = store.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].message_id, first_id);
    }

    #[tokio::test]
    async fn mark_published_is_idempotent() {
        let store = InMemoryOutbox::new();
        let message = msg(b"x");
        let id = message.message_id;
        store.add(message).await.unwrap();

        store.mark_published(id).await.unwrap();
        store.mark_published(id).await.unwrap();

        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Published);
        assert!(store.get_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_failed_keeps_row_pending_and_counts() {
        let store = InMemoryOutbox::new();
        let message = msg(b"x");
        let id = message.message_id;
        store.add(message).await.unwrap();

        assert_eq!(store.mark_failed(id, "broker down").await.unwrap(), 1);
        assert_eq!(store.mark_failed(id, "broker down").await.unwrap(), 2);

        let pending = store.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn sweep_removes_only_old_published_rows() {
        let store = InMemoryOutbox::new();
        let published = msg(b"old");
        let published_id = published.message_id;
        let pending = msg(b"new");
        store.add(published).await.unwrap();
        store.add(pending).await.unwrap();
        store.mark_published(published_id).await.unwrap();

        let removed = store.sweep_published(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
