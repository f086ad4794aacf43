//! Handler contracts and the per-call resolution context.

use async_trait::async_trait;
use catga_core::{MessageId, Result};
use tokio_util::sync::CancellationToken;

/// A command or query dispatched to exactly one handler.
pub trait Request: Send + Sync + 'static {
    type Response: Send + 'static;

    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A notification fanned out to every registered handler.
pub trait Event: Send + Sync + 'static {
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync {
    async fn handle(&self, request: &R, ctx: &RequestContext) -> Result<R::Response>;
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E, ctx: &RequestContext) -> Result<()>;
}

/// Request types may declare an invariant check; wired into the
/// pipeline via [`crate::HandlerRegistry::register_validator`].
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Request/response types may declare span tags; reflected into the
/// tracing behavior via the tag registry, populated at registration
/// time so the hot path stays reflection-free.
pub trait Taggable {
    fn tags(&self) -> Vec<(&'static str, String)>;
}

/// Per-call resolution context: correlation metadata plus the
/// cancellation signal threaded through the pipeline.
#[derive(Clone)]
pub struct RequestContext {
    pub correlation_id: Option<MessageId>,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self { correlation_id: None, cancellation: CancellationToken::new() }
    }

    pub fn with_correlation(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
