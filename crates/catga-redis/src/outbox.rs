//! Redis-backed outbox: one hash per message, sorted sets (scored by
//! creation time) as the Pending and Published indexes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use catga_core::{CatgaError, MessageId, Result};
use catga_outbox::{OutboxMessage, OutboxStatus, OutboxStore};

use crate::{redis_err, RedisBackend};

pub struct RedisOutbox {
    backend: RedisBackend,
}

impl RedisOutbox {
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn msg_key(&self, message_id: MessageId) -> String {
        self.backend.key(&format!("outbox:msg:{message_id}"))
    }

    fn pending_key(&self) -> String {
        self.backend.key("outbox:pending")
    }

    fn published_key(&self) -> String {
        self.backend.key("outbox:published")
    }

    async fn load(&self, message_id: MessageId) -> Result<Option<OutboxMessage>> {
        let mut conn = self.backend.conn();
        let fields: Vec<(String, Vec<u8>)> = redis::cmd("HGETALL")
            .arg(self.msg_key(message_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut message = OutboxMessage::new(message_id, "", Bytes::new());
        for (field, value) in fields {
            match field.as_str() {
                "message_type" => {
                    message.message_type = String::from_utf8_lossy(&value).into_owned()
                }
                "payload" => message.payload = Bytes::from(value),
                "status" => {
                    message.status = match value.as_slice() {
                        b"published" => OutboxStatus::Published,
                        b"failed" => OutboxStatus::Failed,
                        _ => OutboxStatus::Pending,
                    }
                }
                "created_at" => {
                    let ms: i64 = String::from_utf8_lossy(&value).parse().unwrap_or(0);
                    message.created_at =
                        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
                }
                "retry_count" => {
                    message.retry_count = String::from_utf8_lossy(&value).parse().unwrap_or(0)
                }
                "last_error" => {
                    if !value.is_empty() {
                        message.last_error = Some(String::from_utf8_lossy(&value).into_owned());
                    }
                }
                _ => {}
            }
        }
        Ok(Some(message))
    }
}

#[async_trait]
impl OutboxStore for RedisOutbox {
    async fn add(&self, message: OutboxMessage) -> Result<()> {
        let mut conn = self.backend.conn();
        let created_ms = message.created_at.timestamp_millis();

        let _: () = redis::cmd("HSET")
            .arg(self.msg_key(message.message_id))
            .arg("message_type")
            .arg(&message.message_type)
            .arg("payload")
            .arg(message.payload.as_ref())
            .arg("status")
            .arg("pending")
            .arg("created_at")
            .arg(created_ms)
            .arg("retry_count")
            .arg(message.retry_count)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let _: i32 = redis::cmd("ZADD")
            .arg(self.pending_key())
            .arg(created_ms)
            .arg(message.message_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let mut conn = self.backend.conn();
        let ids: Vec<i64> = redis::cmd("ZRANGE")
            .arg(self.pending_key())
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut rows = Vec::with_capacity(ids.len());
        for raw in ids {
            if let Some(message) = self.load(MessageId::from_raw(raw)).await? {
                rows.push(message);
            }
        }
        Ok(rows)
    }

    async fn mark_published(&self, message_id: MessageId) -> Result<()> {
        let mut conn = self.backend.conn();
        let created: Option<String> = redis::cmd("HGET")
            .arg(self.msg_key(message_id))
            .arg("created_at")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let score: i64 = created.and_then(|s| s.parse().ok()).unwrap_or(0);

        let _: () = redis::cmd("HSET")
            .arg(self.msg_key(message_id))
            .arg("status")
            .arg("published")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let _: i32 = redis::cmd("ZREM")
            .arg(self.pending_key())
            .arg(message_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let _: i32 = redis::cmd("ZADD")
            .arg(self.published_key())
            .arg(score)
            .arg(message_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn mark_failed(&self, message_id: MessageId, reason: &str) -> Result<u32> {
        let mut conn = self.backend.conn();
        let retry_count: i64 = redis::cmd("HINCRBY")
            .arg(self.msg_key(message_id))
            .arg("retry_count")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let _: () = redis::cmd("HSET")
            .arg(self.msg_key(message_id))
            .arg("last_error")
            .arg(reason)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(retry_count as u32)
    }

    async fn mark_abandoned(&self, message_id: MessageId) -> Result<()> {
        let mut conn = self.backend.conn();
        let _: () = redis::cmd("HSET")
            .arg(self.msg_key(message_id))
            .arg("status")
            .arg("failed")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let _: i32 = redis::cmd("ZREM")
            .arg(self.pending_key())
            .arg(message_id.as_i64())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn sweep_published(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.backend.conn();
        let cutoff = older_than.timestamp_millis();
        let ids: Vec<i64> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.published_key())
            .arg("-inf")
            .arg(format!("({cutoff}"))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if ids.is_empty() {
            return Ok(0);
        }

        for raw in &ids {
            let _: i32 = redis::cmd("DEL")
                .arg(self.msg_key(MessageId::from_raw(*raw)))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
        }
        let removed: i32 = {
            let mut cmd = redis::cmd("ZREM");
            cmd.arg(self.published_key());
            for raw in &ids {
                cmd.arg(*raw);
            }
            cmd.query_async(&mut conn).await.map_err(redis_err)?
        };
        usize::try_from(removed)
            .map_err(|_| CatgaError::Persistence { message: "negative ZREM count".into(), retryable: false })
    }
}
