//! Redis bindings for the Catga store contracts.
//!
//! One [`RedisBackend`] (a managed connection plus a key prefix) is
//! shared by the per-contract stores. Key layout, per store:
//!
//! - lock:        `{prefix}:lock:{resource}` -> owner token, PX lease
//! - idempotency: `{prefix}:idem:{id}` -> result payload, PX ttl
//! - inbox:       `{prefix}:inbox:lock:{id}`, `{prefix}:inbox:done:{id}`
//! - outbox:      `{prefix}:outbox:msg:{id}` hash, pending/published zsets
//! - dlq:         `{prefix}:dlq:{id}` hash, `{prefix}:dlq:ids` list
//! - scheduler:   `{prefix}:sched:{id}` hash, `{prefix}:sched:due` zset

mod dlq;
mod idempotency;
mod inbox;
mod lock;
mod outbox;
mod scheduler;

pub use dlq::RedisDlq;
pub use idempotency::RedisIdempotencyStore;
pub use inbox::RedisInbox;
pub use lock::RedisLock;
pub use outbox::RedisOutbox;
pub use scheduler::RedisSchedulerStore;

use redis::aio::ConnectionManager;

use catga_core::CatgaError;

/// Shared connection + key prefix.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connect with the default `catga` key prefix.
    pub async fn connect(redis_url: &str) -> catga_core::Result<Self> {
        Self::connect_with_prefix(redis_url, "catga").await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: &str,
    ) -> catga_core::Result<Self> {
        let client = redis::Client::open(redis_url).map_err(redis_err)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;
        Ok(Self { conn, prefix: prefix.to_string() })
    }

    pub(crate) fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }
}

/// Redis failures are transient persistence failures: connection
/// management retries underneath and callers go through the resilience
/// pipeline.
pub(crate) fn redis_err(e: redis::RedisError) -> CatgaError {
    CatgaError::Persistence { message: e.to_string(), retryable: true }
}
