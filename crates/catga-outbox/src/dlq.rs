//! Dead-letter queue: the sink for messages that exhausted retries.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

use catga_core::{MessageEnvelope, MessageId, Result};

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub message_id: MessageId,
    pub original_message_type: String,
    pub payload: Bytes,
    pub failure_reason: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn from_envelope(envelope: &MessageEnvelope, reason: impl Into<String>, retry_count: u32) -> Self {
        Self {
            message_id: envelope.message_id,
            original_message_type: envelope.message_type.clone(),
            payload: envelope.payload.clone(),
            failure_reason: reason.into(),
            retry_count,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Persist a failed message. Entries stay until explicit removal.
    async fn send(&self, entry: DlqEntry) -> Result<()>;

    /// Read-only view for operator tooling and redrive.
    async fn get_failed_messages(&self, limit: usize) -> Result<Vec<DlqEntry>>;

    /// Remove an entry, e.g. after a successful redrive.
    async fn remove(&self, message_id: MessageId) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryDlq {
    entries: Mutex<VecDeque<DlqEntry>>,
}

impl InMemoryDlq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDlq {
    async fn send(&self, entry: DlqEntry) -> Result<()> {
        self.entries.lock().push_back(entry);
        Ok(())
    }

    async fn get_failed_messages(&self, limit: usize) -> Result<Vec<DlqEntry>> {
        Ok(self.entries.lock().iter().take(limit).cloned().collect())
    }

    async fn remove(&self, message_id: MessageId) -> Result<bool> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.message_id != message_id);
        Ok(entries.len() < before)
    }
}
