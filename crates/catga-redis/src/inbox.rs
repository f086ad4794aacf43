//! Redis-backed inbox: the per-MessageId lock is a SET NX PX key (an
//! expired lock is simply gone, so takeover is the NX succeeding), the
//! Processed marker is a separate persistent key holding the result.

use std::time::Duration;

use async_trait::async_trait;

use catga_core::{MessageId, Result};
use catga_outbox::{InboxMessage, InboxStore};

use crate::{redis_err, RedisBackend};

pub struct RedisInbox {
    backend: RedisBackend,
    /// How long Processed markers are kept for dedup of replays.
    processed_retention: Duration,
}

impl RedisInbox {
    pub fn new(backend: RedisBackend, processed_retention: Duration) -> Self {
        Self { backend, processed_retention }
    }

    fn lock_key(&self, message_id: MessageId) -> String {
        self.backend.key(&format!("inbox:lock:{message_id}"))
    }

    fn done_key(&self, message_id: MessageId) -> String {
        self.backend.key(&format!("inbox:done:{message_id}"))
    }
}

#[async_trait]
impl InboxStore for RedisInbox {
    async fn try_lock(&self, message_id: MessageId, ttl: Duration) -> Result<bool> {
        let mut conn = self.backend.conn();

        // Processed wins over any lock attempt.
        let done: i32 = redis::cmd("EXISTS")
            .arg(self.done_key(message_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if done == 1 {
            return Ok(false);
        }

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(message_id))
            .arg("locked")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(acquired.is_some())
    }

    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool> {
        let mut conn = self.backend.conn();
        let done: i32 = redis::cmd("EXISTS")
            .arg(self.done_key(message_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(done == 1)
    }

    async fn mark_processed(&self, message: InboxMessage) -> Result<()> {
        let mut conn = self.backend.conn();
        let result = message
            .processing_result
            .as_ref()
            .map(|b| b.to_vec())
            .unwrap_or_default();

        let _: () = redis::cmd("SET")
            .arg(self.done_key(message.message_id))
            .arg(result)
            .arg("PX")
            .arg(self.processed_retention.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let _: i32 = redis::cmd("DEL")
            .arg(self.lock_key(message.message_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}
