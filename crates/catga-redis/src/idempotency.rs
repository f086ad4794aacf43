//! Redis-backed idempotency store: SET NX PX gives atomic first-win
//! marks with a TTL.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use catga_core::{MessageId, Result};
use catga_outbox::IdempotencyStore;

use crate::{redis_err, RedisBackend};

pub struct RedisIdempotencyStore {
    backend: RedisBackend,
    ttl: Duration,
}

impl RedisIdempotencyStore {
    pub fn new(backend: RedisBackend, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn key(&self, message_id: MessageId) -> String {
        self.backend.key(&format!("idem:{message_id}"))
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool> {
        let mut conn = self.backend.conn();
        let exists: i32 = redis::cmd("EXISTS")
            .arg(self.key(message_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(exists == 1)
    }

    async fn mark_processed(&self, message_id: MessageId, result: Bytes) -> Result<()> {
        let mut conn = self.backend.conn();
        // NX keeps the first write; later marks are no-ops.
        let _: Option<String> = redis::cmd("SET")
            .arg(self.key(message_id))
            .arg(result.as_ref())
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn get_cached_result(&self, message_id: MessageId) -> Result<Option<Bytes>> {
        let mut conn = self.backend.conn();
        let payload: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.key(message_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(payload.map(Bytes::from))
    }
}
