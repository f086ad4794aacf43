//! Exclusive resources and admission control: distributed locks with
//! ownership tokens, and a keyed rate limiter.

pub mod lock;
pub mod rate_limiter;

pub use lock::{DistributedLock, InMemoryDistributedLock, LockBackend, LockHandle};
pub use rate_limiter::{GovernorRateLimiter, RateLimitDecision, RateLimiter};
