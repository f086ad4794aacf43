//! Redis-backed distributed lock.
//!
//! SET NX PX for atomic acquisition; Lua check-and-extend and
//! check-and-delete so a stale handle can never touch a lease another
//! owner took over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use catga_core::Result;
use catga_lock::{DistributedLock, LockBackend, LockHandle};

use crate::{redis_err, RedisBackend};

const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

struct RedisLockOps {
    backend: RedisBackend,
}

impl RedisLockOps {
    fn lock_key(&self, resource: &str) -> String {
        self.backend.key(&format!("lock:{resource}"))
    }
}

#[async_trait]
impl LockBackend for RedisLockOps {
    async fn extend(&self, resource: &str, token: &str, new_expiry: Duration) -> Result<bool> {
        let mut conn = self.backend.conn();
        let result: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(self.lock_key(resource))
            .arg(token)
            .arg(new_expiry.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(result == 1)
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let mut conn = self.backend.conn();
        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(resource))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(result == 1)
    }
}

#[derive(Clone)]
pub struct RedisLock {
    inner: Arc<RedisLockOps>,
}

impl RedisLock {
    pub fn new(backend: RedisBackend) -> Self {
        Self { inner: Arc::new(RedisLockOps { backend }) }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, resource: &str, expiry: Duration) -> Result<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.inner.backend.conn();

        // SET key token NX PX millis
        let result: Option<String> = redis::cmd("SET")
            .arg(self.inner.lock_key(resource))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(expiry.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        if result.is_none() {
            return Ok(None);
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::seconds(30));
        Ok(Some(LockHandle::new(
            resource,
            token,
            expires_at,
            self.inner.clone() as Arc<dyn LockBackend>,
        )))
    }
}
