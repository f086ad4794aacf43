//! Redis-backed schedule store: one hash per schedule, a due-time
//! sorted set as the Pending index.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use catga_core::Result;
use catga_scheduler::{ScheduleStatus, ScheduledMessage, SchedulerStore};

use crate::{redis_err, RedisBackend};

pub struct RedisSchedulerStore {
    backend: RedisBackend,
}

impl RedisSchedulerStore {
    pub fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn row_key(&self, schedule_id: &str) -> String {
        self.backend.key(&format!("sched:{schedule_id}"))
    }

    fn due_key(&self) -> String {
        self.backend.key("sched:due")
    }

    async fn load(&self, schedule_id: &str) -> Result<Option<ScheduledMessage>> {
        let mut conn = self.backend.conn();
        let fields: Vec<(String, Vec<u8>)> = redis::cmd("HGETALL")
            .arg(self.row_key(schedule_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut message = ScheduledMessage::new("", Bytes::new(), Utc::now());
        message.schedule_id = schedule_id.to_string();
        for (field, value) in fields {
            match field.as_str() {
                "message_type" => {
                    message.message_type = String::from_utf8_lossy(&value).into_owned()
                }
                "payload" => message.payload = Bytes::from(value),
                "deliver_at" => {
                    let ms: i64 = String::from_utf8_lossy(&value).parse().unwrap_or(0);
                    message.deliver_at =
                        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
                }
                "created_at" => {
                    let ms: i64 = String::from_utf8_lossy(&value).parse().unwrap_or(0);
                    message.created_at =
                        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
                }
                "status" => {
                    message.status = match value.as_slice() {
                        b"delivered" => ScheduleStatus::Delivered,
                        b"cancelled" => ScheduleStatus::Cancelled,
                        _ => ScheduleStatus::Pending,
                    }
                }
                _ => {}
            }
        }
        Ok(Some(message))
    }

    async fn ids_by_score(&self, max_score: Option<i64>, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.backend.conn();
        let max = max_score.map(|s| s.to_string()).unwrap_or_else(|| "+inf".to_string());
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.due_key())
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit as i64)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(ids)
    }

    async fn drop_from_due(&self, schedule_id: &str) -> Result<()> {
        let mut conn = self.backend.conn();
        let _: i32 = redis::cmd("ZREM")
            .arg(self.due_key())
            .arg(schedule_id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for RedisSchedulerStore {
    async fn insert(&self, message: ScheduledMessage) -> Result<()> {
        let mut conn = self.backend.conn();
        let _: () = redis::cmd("HSET")
            .arg(self.row_key(&message.schedule_id))
            .arg("message_type")
            .arg(&message.message_type)
            .arg("payload")
            .arg(message.payload.as_ref())
            .arg("deliver_at")
            .arg(message.deliver_at.timestamp_millis())
            .arg("created_at")
            .arg(message.created_at.timestamp_millis())
            .arg("status")
            .arg("pending")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let _: i32 = redis::cmd("ZADD")
            .arg(self.due_key())
            .arg(message.deliver_at.timestamp_millis())
            .arg(&message.schedule_id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn cancel(&self, schedule_id: &str) -> Result<bool> {
        match self.load(schedule_id).await? {
            Some(row) if row.status == ScheduleStatus::Pending => {
                let mut conn = self.backend.conn();
                let _: () = redis::cmd("HSET")
                    .arg(self.row_key(schedule_id))
                    .arg("status")
                    .arg("cancelled")
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_err)?;
                self.drop_from_due(schedule_id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledMessage>> {
        self.load(schedule_id).await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<ScheduledMessage>> {
        let ids = self.ids_by_score(None, limit).await?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.load(&id).await? {
                if row.status == ScheduleStatus::Pending {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>> {
        let ids = self.ids_by_score(Some(now.timestamp_millis()), limit).await?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.load(&id).await? {
                if row.status == ScheduleStatus::Pending {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    async fn mark_delivered(&self, schedule_id: &str) -> Result<()> {
        let mut conn = self.backend.conn();
        let _: () = redis::cmd("HSET")
            .arg(self.row_key(schedule_id))
            .arg("status")
            .arg("delivered")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.drop_from_due(schedule_id).await
    }
}
