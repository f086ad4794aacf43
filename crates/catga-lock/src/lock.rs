//! Cluster-wide mutual exclusion with ownership tokens and bounded
//! leases.
//!
//! At any instant at most one valid handle exists per resource. Every
//! extend and release re-checks the owner token, so a handle that
//! outlived its lease cannot touch a lock someone else now holds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use catga_core::{CatgaError, Result};

/// Backend operations a handle needs after acquisition. Token-checked:
/// both return false when ownership was lost.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn extend(&self, resource: &str, token: &str, new_expiry: Duration) -> Result<bool>;

    async fn release(&self, resource: &str, token: &str) -> Result<bool>;
}

/// Proof of ownership of a resource until `expires_at`.
pub struct LockHandle {
    resource: String,
    owner_token: String,
    expires_at: DateTime<Utc>,
    backend: Arc<dyn LockBackend>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("owner_token", &self.owner_token)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl LockHandle {
    pub fn new(
        resource: impl Into<String>,
        owner_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        backend: Arc<dyn LockBackend>,
    ) -> Self {
        Self {
            resource: resource.into(),
            owner_token: owner_token.into(),
            expires_at,
            backend,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Push the lease out. Fails with `LockLost` when the lock expired
    /// or was taken over in the meantime.
    pub async fn extend(&mut self, new_expiry: Duration) -> Result<()> {
        let extended = self
            .backend
            .extend(&self.resource, &self.owner_token, new_expiry)
            .await?;
        if !extended {
            return Err(CatgaError::LockLost(self.resource.clone()));
        }
        self.expires_at = Utc::now() + to_chrono(new_expiry);
        Ok(())
    }

    /// Delete the lock if still owned. Releasing a lost lock is a
    /// no-op: another owner's lock is never touched.
    pub async fn release(self) -> Result<()> {
        let released = self.backend.release(&self.resource, &self.owner_token).await?;
        if !released {
            debug!(resource = %self.resource, "lock already lost at release");
        }
        Ok(())
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Non-blocking acquisition; `None` when the resource is held.
    async fn try_acquire(&self, resource: &str, expiry: Duration) -> Result<Option<LockHandle>>;

    /// Retry until acquired or `wait_timeout` is exhausted.
    async fn acquire(
        &self,
        resource: &str,
        expiry: Duration,
        wait_timeout: Duration,
    ) -> Result<LockHandle> {
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            if let Some(handle) = self.try_acquire(resource, expiry).await? {
                return Ok(handle);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CatgaError::Timeout(wait_timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[derive(Debug, Clone)]
struct LockRow {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct LockMap {
    locks: DashMap<String, LockRow>,
}

#[async_trait]
impl LockBackend for LockMap {
    async fn extend(&self, resource: &str, token: &str, new_expiry: Duration) -> Result<bool> {
        match self.locks.get_mut(resource) {
            Some(mut row) if row.token == token && row.expires_at > Utc::now() => {
                row.expires_at = Utc::now() + to_chrono(new_expiry);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let removed = self
            .locks
            .remove_if(resource, |_, row| row.token == token)
            .is_some();
        Ok(removed)
    }
}

/// Process-local lock backend for tests and single-node deployments.
#[derive(Clone, Default)]
pub struct InMemoryDistributedLock {
    inner: Arc<LockMap>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn try_acquire(&self, resource: &str, expiry: Duration) -> Result<Option<LockHandle>> {
        let now = Utc::now();
        let token = Uuid::new_v4().to_string();
        let expires_at = now + to_chrono(expiry);

        let mut acquired = false;
        self.inner
            .locks
            .entry(resource.to_string())
            .and_modify(|row| {
                if row.expires_at <= now {
                    // Expired lease: steal it.
                    row.token = token.clone();
                    row.expires_at = expires_at;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockRow { token: token.clone(), expires_at }
            });

        Ok(acquired.then(|| {
            LockHandle::new(resource, token, expires_at, self.inner.clone() as Arc<dyn LockBackend>)
        }))
    }
}
