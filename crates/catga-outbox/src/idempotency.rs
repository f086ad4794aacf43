//! Cached-result store guaranteeing at-most-once effect within a TTL.
//!
//! Sharded to keep lock contention low under concurrent deliveries;
//! `mark_processed` is first-win, so concurrent marks for one id leave
//! exactly one retrievable value.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use catga_core::{JsonSerializer, MessageId, Result, Serializer};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool>;

    /// Cache `result` for `message_id`. First win: later marks for the
    /// same id are no-ops.
    async fn mark_processed(&self, message_id: MessageId, result: Bytes) -> Result<()>;

    /// The cached result, if still within its TTL.
    async fn get_cached_result(&self, message_id: MessageId) -> Result<Option<Bytes>>;
}

/// Typed convenience over the byte-level contract.
#[async_trait]
pub trait IdempotencyStoreExt: IdempotencyStore {
    async fn mark_processed_as<T: Serialize + Send + Sync>(
        &self,
        message_id: MessageId,
        result: &T,
    ) -> Result<()> {
        let payload = JsonSerializer.serialize(result)?;
        self.mark_processed(message_id, payload).await
    }

    async fn get_cached_as<T: DeserializeOwned>(
        &self,
        message_id: MessageId,
    ) -> Result<Option<T>> {
        match self.get_cached_result(message_id).await? {
            Some(payload) => Ok(Some(JsonSerializer.deserialize(&payload)?)),
            None => Ok(None),
        }
    }
}

impl<T: IdempotencyStore + ?Sized> IdempotencyStoreExt for T {}

struct CachedResult {
    payload: Bytes,
    expires_at: Instant,
}

pub struct ShardedIdempotencyStore {
    shards: Vec<Mutex<HashMap<MessageId, CachedResult>>>,
    ttl: Duration,
}

impl ShardedIdempotencyStore {
    pub fn new(shard_count: usize, ttl: Duration) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
        }
    }

    /// Shard count and TTL from the `[idempotency]` section.
    pub fn from_config(config: &catga_config::IdempotencyConfig) -> Self {
        Self::new(config.shard_count, config.ttl())
    }

    fn shard(&self, message_id: MessageId) -> &Mutex<HashMap<MessageId, CachedResult>> {
        let index = (message_id.as_i64() as u64 % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Drop expired entries across all shards. Returns how many were
    /// evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, cached| cached.expires_at > now);
            evicted += before - map.len();
        }
        evicted
    }
}

#[async_trait]
impl IdempotencyStore for ShardedIdempotencyStore {
    async fn has_been_processed(&self, message_id: MessageId) -> Result<bool> {
        let shard = self.shard(message_id).lock();
        Ok(shard
            .get(&message_id)
            .map(|cached| cached.expires_at > Instant::now())
            .unwrap_or(false))
    }

    async fn mark_processed(&self, message_id: MessageId, result: Bytes) -> Result<()> {
        let mut shard = self.shard(message_id).lock();
        let now = Instant::now();
        match shard.get(&message_id) {
            Some(existing) if existing.expires_at > now => {}
            _ => {
                shard.insert(
                    message_id,
                    CachedResult { payload: result, expires_at: now + self.ttl },
                );
            }
        }
        Ok(())
    }

    async fn get_cached_result(&self, message_id: MessageId) -> Result<Option<Bytes>> {
        let shard = self.shard(message_id).lock();
        Ok(shard.get(&message_id).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.payload.clone())
            } else {
                None
            }
        }))
    }
}
