//! Redis-backed dead-letter queue: one hash per entry plus an id list
//! preserving arrival order.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};

use catga_core::{MessageId, Result};
use catga_outbox::{DeadLetterQueue, DlqEntry};

use crate::{redis_err, RedisBackend};

pub struct RedisDlq {
    backend: RedisBackend,
}

impl RedisDlq {
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn entry_key(&self, message_id: MessageId) -> String {
        self.backend.key(&format!("dlq:{message_id}"))
    }

    fn ids_key(&self) -> String {
        self.backend.key("dlq:ids")
    }
}

#[async_trait]
impl DeadLetterQueue for RedisDlq {
    async fn send(&self, entry: DlqEntry) -> Result<()> {
        let mut conn = self.backend.conn();
        let _: () = redis::cmd("HSET")
            .arg(self.entry_key(entry.message_id))
            .arg("message_type")
            .arg(&entry.original_message_type)
            .arg("payload")
            .arg(entry.payload.as_ref())
            .arg("failure_reason")
            .arg(&entry.failure_reason)
            .arg("retry_count")
            .arg(entry.retry_count)
            .arg("failed_at")
            .arg(entry.failed_at.timestamp_millis())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let _: i32 = redis::cmd("RPUSH")
            .arg(self.ids_key())
            .arg(entry.message_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn get_failed_messages(&self, limit: usize) -> Result<Vec<DlqEntry>> {
        let mut conn = self.backend.conn();
        let ids: Vec<i64> = redis::cmd("LRANGE")
            .arg(self.ids_key())
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut entries = Vec::with_capacity(ids.len());
        for raw in ids {
            let message_id = MessageId::from_raw(raw);
            let fields: Vec<(String, Vec<u8>)> = redis::cmd("HGETALL")
                .arg(self.entry_key(message_id))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            if fields.is_empty() {
                continue;
            }

            let mut entry = DlqEntry {
                message_id,
                original_message_type: String::new(),
                payload: Bytes::new(),
                failure_reason: String::new(),
                retry_count: 0,
                failed_at: Utc::now(),
            };
            for (field, value) in fields {
                match field.as_str() {
                    "message_type" => {
                        entry.original_message_type = String::from_utf8_lossy(&value).into_owned()
                    }
                    "payload" => entry.payload = Bytes::from(value),
                    "failure_reason" => {
                        entry.failure_reason = String::from_utf8_lossy(&value).into_owned()
                    }
                    "retry_count" => {
                        entry.retry_count = String::from_utf8_lossy(&value).parse().unwrap_or(0)
                    }
                    "failed_at" => {
                        let ms: i64 = String::from_utf8_lossy(&value).parse().unwrap_or(0);
                        entry.failed_at =
                            Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
                    }
                    _ => {}
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn remove(&self, message_id: MessageId) -> Result<bool> {
        let mut conn = self.backend.conn();
        let removed: i32 = redis::cmd("LREM")
            .arg(self.ids_key())
            .arg(0)
            .arg(message_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let _: i32 = redis::cmd("DEL")
            .arg(self.entry_key(message_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }
}
