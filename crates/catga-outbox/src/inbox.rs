//! Consumer-side dedup and per-MessageId lock store.
//!
//! The first delivery of a message creates a Processing lock row with a
//! TTL; duplicates fail to acquire and are dropped. A handler crash
//! leaves the lock to expire, so the next redelivery takes over.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;

use catga_core::{MessageId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Bytes,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_result: Option<Bytes>,
}

impl InboxMessage {
    pub fn received(message_id: MessageId, message_type: impl Into<String>, payload: Bytes) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload,
            status: InboxStatus::Processing,
            received_at: Utc::now(),
            processed_at: None,
            processing_result: None,
        }
    }

    pub fn processed(mut self, result: Option<Bytes>) -> Self {
        self.status = InboxStatus::Processed;
        self.processed_at = Some(Utc::now());
        self.processing_result = result;
        self
    }
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Atomically create a lock row with the given TTL. Returns true if
    /// newly acquired; false when another consumer holds a live lock or
    /// the message was already Processed. An expired lock is taken over.
    async fn try_lock(&self, message_id: MessageId, ttl: Duration) -> Result<bool>;

    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool>;

    /// Transition to Processed, keeping the result for replay lookups.
    async fn mark_processed(&self, message: InboxMessage) -> Result<()>;
}

#[derive(Debug, Clone)]
struct LockRow {
    status: InboxStatus,
    locked_until: DateTime<Utc>,
    message: Option<InboxMessage>,
}

#[derive(Default)]
pub struct InMemoryInbox {
    rows: DashMap<MessageId, LockRow>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processing_result(&self, message_id: MessageId) -> Option<Bytes> {
        self.rows
            .get(&message_id)
            .and_then(|row| row.message.as_ref().and_then(|m| m.processing_result.clone()))
    }
}

#[async_trait]
impl InboxStore for InMemoryInbox {
    async fn try_lock(&self, message_id: MessageId, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(30));

        let mut acquired = false;
        let entry = self.rows.entry(message_id);
        entry
            .and_modify(|row| match row.status {
                InboxStatus::Processed => {}
                // A live lock blocks; an expired one is taken over.
                InboxStatus::Processing | InboxStatus::Failed => {
                    if row.locked_until <= now {
                        row.status = InboxStatus::Processing;
                        row.locked_until = now + ttl;
                        acquired = true;
                    }
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockRow {
                    status: InboxStatus::Processing,
                    locked_until: now + ttl,
                    message: None,
                }
            });
        Ok(acquired)
    }

    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool> {
        Ok(self
            .rows
            .get(&message_id)
            .map(|row| row.status == InboxStatus::Processed)
            .unwrap_or(false))
    }

    async fn mark_processed(&self, message: InboxMessage) -> Result<()> {
        let message = if message.status == InboxStatus::Processed {
            message
        } else {
            message.processed(None)
        };
        self.rows.insert(
            message.message_id,
            LockRow {
                status: InboxStatus::Processed,
                locked_until: DateTime::<Utc>::MAX_UTC,
                message: Some(message),
            },
        );
        Ok(())
    }
}
