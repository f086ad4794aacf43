//! Retry/timeout wrappers applied per call-class.
//!
//! Each class (mediator dispatch, transport publish/send, persistence)
//! carries its own policy. Only transient failures are retried;
//! cancellation and business failures pass straight through.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CatgaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallClass {
    Mediator,
    TransportPublish,
    TransportSend,
    Persistence,
}

impl CallClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallClass::Mediator => "mediator",
            CallClass::TransportPublish => "transport_publish",
            CallClass::TransportSend => "transport_send",
            CallClass::Persistence => "persistence",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Delay multiplier applied per attempt; 1.0 disables backoff.
    pub backoff_multiplier: f64,
    /// Per-attempt deadline; `None` means no timeout.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    /// Policy that runs the call once with no timeout.
    pub fn none() -> Self {
        Self { max_attempts: 1, retry_delay: Duration::ZERO, backoff_multiplier: 1.0, timeout: None }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.retry_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        // Up to 10% jitter keeps concurrent retries from stampeding.
        let jitter = rand::thread_rng().gen_range(0.0..0.1) * base;
        Duration::from_millis((base + jitter) as u64)
    }
}

/// Per-call-class resilience wrapper.
#[derive(Debug, Clone, Default)]
pub struct ResiliencePipeline {
    policies: HashMap<CallClass, RetryPolicy>,
}

impl ResiliencePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, class: CallClass, policy: RetryPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    pub fn policy(&self, class: CallClass) -> RetryPolicy {
        self.policies.get(&class).cloned().unwrap_or_default()
    }

    /// Run `op`, retrying transient failures per the class policy.
    ///
    /// `op` is a factory so each attempt gets a fresh future. A timed-out
    /// attempt may still have completed remotely; callers recover through
    /// idempotency/dedup.
    pub async fn execute<T, F, Fut>(
        &self,
        class: CallClass,
        op_name: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy(class);
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CatgaError::Cancelled);
            }

            let outcome = match policy.timeout {
                Some(deadline) => tokio::select! {
                    res = tokio::time::timeout(deadline, op()) => match res {
                        Ok(inner) => inner,
                        Err(_) => Err(CatgaError::Timeout(deadline)),
                    },
                    _ = cancel.cancelled() => return Err(CatgaError::Cancelled),
                },
                None => tokio::select! {
                    res = op() => res,
                    _ = cancel.cancelled() => return Err(CatgaError::Cancelled),
                },
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(class = class.as_str(), op = op_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    warn!(
                        class = class.as_str(),
                        op = op_name,
                        attempt,
                        error = %err,
                        "retry"
                    );
                    metrics::counter!("catga.resilience.retries_total").increment(1);
                    let delay = policy.delay_for_attempt(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(CatgaError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
