//! The behavior pipeline wrapping request dispatch.
//!
//! Behaviors nest in LIFO order: the first behavior added runs
//! outermost. `Next` is replayable, which is what lets the retry
//! behavior re-run the inner chain with a fresh handler future.

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use catga_core::{CatgaError, MessageId, Result};

use crate::registry::{BoxedResponse, HandlerRegistry, PipelineFuture};

/// Request metadata visible to behaviors. The request itself travels as
/// `Any`; typed access goes through functions captured at registration.
pub struct RequestInfo {
    pub request_type: &'static str,
    pub request_type_id: TypeId,
    pub message_id: MessageId,
    pub correlation_id: Option<MessageId>,
    pub request: Arc<dyn Any + Send + Sync>,
    /// Declared request tags, extracted at dispatch entry.
    pub tags: Vec<(String, String)>,
}

/// Replayable continuation to the rest of the pipeline.
#[derive(Clone)]
pub struct Next {
    inner: Arc<dyn Fn() -> PipelineFuture + Send + Sync>,
}

impl Next {
    pub fn new(f: impl Fn() -> PipelineFuture + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub async fn run(&self) -> Result<BoxedResponse> {
        (self.inner)().await
    }
}

#[async_trait]
pub trait Behavior: Send + Sync {
    async fn handle(
        &self,
        info: Arc<RequestInfo>,
        next: Next,
        cancel: CancellationToken,
    ) -> Result<BoxedResponse>;
}

/// Nest `behaviors` around `base`, first behavior outermost.
pub(crate) fn compose(
    behaviors: &[Arc<dyn Behavior>],
    info: Arc<RequestInfo>,
    cancel: CancellationToken,
    base: Next,
) -> Next {
    let mut next = base;
    for behavior in behaviors.iter().rev() {
        let behavior = behavior.clone();
        let info = info.clone();
        let cancel = cancel.clone();
        let inner = next;
        next = Next::new(move || {
            let behavior = behavior.clone();
            let info = info.clone();
            let cancel = cancel.clone();
            let inner = inner.clone();
            Box::pin(async move { behavior.handle(info, inner, cancel).await })
        });
    }
    next
}

/// Logs dispatch outcome and latency.
pub struct LoggingBehavior;

#[async_trait]
impl Behavior for LoggingBehavior {
    async fn handle(
        &self,
        info: Arc<RequestInfo>,
        next: Next,
        _cancel: CancellationToken,
    ) -> Result<BoxedResponse> {
        let started = Instant::now();
        debug!(request_type = info.request_type, message_id = %info.message_id, "dispatching");

        let result = next.run().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                debug!(request_type = info.request_type, elapsed_ms, "dispatched");
            }
            Err(CatgaError::Cancelled) => {
                debug!(request_type = info.request_type, elapsed_ms, "dispatch cancelled");
            }
            Err(e) => {
                warn!(request_type = info.request_type, elapsed_ms, error = %e, "dispatch failed");
            }
        }
        result
    }
}

/// Opens a span named after the request type and reflects declared
/// request/response tags into span attributes.
pub struct TracingBehavior {
    registry: Arc<HandlerRegistry>,
}

impl TracingBehavior {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Behavior for TracingBehavior {
    async fn handle(
        &self,
        info: Arc<RequestInfo>,
        next: Next,
        _cancel: CancellationToken,
    ) -> Result<BoxedResponse> {
        let span = info_span!(
            "request",
            otel.name = info.request_type,
            message_id = %info.message_id,
            correlation_id = info.correlation_id.map(|id| id.as_i64()),
        );
        for (key, value) in &info.tags {
            debug!(parent: &span, tag_key = %key, tag_value = %value, "request tag");
        }

        let response_tag_fn = self.registry.response_tag_fn(info.request_type_id);
        let result = next.run().instrument(span.clone()).await;

        if let (Ok(response), Some(tag_fn)) = (&result, response_tag_fn) {
            for (key, value) in tag_fn(response.as_ref() as &dyn Any) {
                debug!(parent: &span, tag_key = %key, tag_value = %value, "response tag");
            }
        }
        result
    }
}

/// Runs the validator declared for the request type; failures are
/// surfaced as `Validation` errors and never retried.
pub struct ValidationBehavior {
    registry: Arc<HandlerRegistry>,
}

impl ValidationBehavior {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Behavior for ValidationBehavior {
    async fn handle(
        &self,
        info: Arc<RequestInfo>,
        next: Next,
        _cancel: CancellationToken,
    ) -> Result<BoxedResponse> {
        if let Some(validator) = self.registry.validator(info.request_type_id) {
            validator(info.request.as_ref() as &dyn Any)?;
        }
        next.run().await
    }
}

/// Retries transient failures. Business failures and validation errors
/// pass through untouched.
pub struct RetryBehavior {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl RetryBehavior {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self { max_attempts, retry_delay }
    }
}

#[async_trait]
impl Behavior for RetryBehavior {
    async fn handle(
        &self,
        info: Arc<RequestInfo>,
        next: Next,
        cancel: CancellationToken,
    ) -> Result<BoxedResponse> {
        let mut attempt = 1u32;
        loop {
            match next.run().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        request_type = info.request_type,
                        attempt,
                        error = %e,
                        "retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = cancel.cancelled() => return Err(CatgaError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bounds each inner execution with a deadline.
pub struct TimeoutBehavior {
    pub timeout: Duration,
}

impl TimeoutBehavior {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Behavior for TimeoutBehavior {
    async fn handle(
        &self,
        info: Arc<RequestInfo>,
        next: Next,
        _cancel: CancellationToken,
    ) -> Result<BoxedResponse> {
        match tokio::time::timeout(self.timeout, next.run()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    request_type = info.request_type,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(CatgaError::Timeout(self.timeout))
            }
        }
    }
}
