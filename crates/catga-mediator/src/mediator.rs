//! The mediator: routes requests to their single handler and fans
//! events out to every subscriber, wrapping dispatch in the behavior
//! pipeline.

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use catga_core::{CatgaError, MessageId, Result};

use crate::handler::{Event, Request, RequestContext};
use crate::pipeline::{compose, Behavior, LoggingBehavior, RequestInfo, RetryBehavior};
use crate::pipeline::{TimeoutBehavior, TracingBehavior, ValidationBehavior};
use crate::registry::HandlerRegistry;

/// Pipeline assembly switches, mirrored by the application-level
/// configuration surface.
#[derive(Debug, Clone)]
pub struct MediatorOptions {
    pub enable_logging: bool,
    pub enable_tracing: bool,
    pub enable_validation: bool,
    pub enable_retry: bool,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
}

impl Default for MediatorOptions {
    fn default() -> Self {
        Self::from(&catga_config::CatgaConfig::default())
    }
}

/// The `[mediator]` section supplies the toggles and limits, the
/// `[resilience.mediator]` section the retry delay.
impl From<&catga_config::CatgaConfig> for MediatorOptions {
    fn from(config: &catga_config::CatgaConfig) -> Self {
        Self {
            enable_logging: config.mediator.enable_logging,
            enable_tracing: config.mediator.enable_tracing,
            enable_validation: config.mediator.enable_validation,
            enable_retry: config.mediator.enable_retry,
            max_retry_attempts: config.mediator.max_retry_attempts,
            retry_delay: Duration::from_millis(config.resilience.mediator.retry_delay_ms),
            timeout: Some(config.mediator.timeout()),
        }
    }
}

pub struct Mediator {
    registry: Arc<HandlerRegistry>,
    behaviors: Vec<Arc<dyn Behavior>>,
}

impl Mediator {
    /// Mediator with no behaviors; dispatch goes straight to handlers.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry, behaviors: Vec::new() }
    }

    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::new()
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Dispatch to exactly one handler.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response> {
        self.send_with(request, RequestContext::new()).await
    }

    pub async fn send_with<R: Request>(
        &self,
        request: R,
        ctx: RequestContext,
    ) -> Result<R::Response> {
        let type_id = TypeId::of::<R>();
        let dispatch = self
            .registry
            .request_dispatch(type_id)
            .ok_or_else(|| CatgaError::NoHandler(R::name().to_string()))?;

        let request: Arc<dyn Any + Send + Sync> = Arc::new(request);
        let tags = self
            .registry
            .request_tag_fn(type_id)
            .map(|f| f(request.as_ref() as &dyn Any))
            .unwrap_or_default();

        let info = Arc::new(RequestInfo {
            request_type: R::name(),
            request_type_id: type_id,
            message_id: MessageId::next(),
            correlation_id: ctx.correlation_id,
            request: request.clone(),
            tags,
        });

        let cancel = ctx.cancellation.clone();
        let base = {
            let request = request.clone();
            let ctx = ctx.clone();
            crate::pipeline::Next::new(move || dispatch(request.clone(), ctx.clone()))
        };

        let chain = compose(&self.behaviors, info, cancel, base);
        let boxed = chain.run().await?;
        boxed.downcast::<R::Response>().map(|b| *b).map_err(|_| {
            CatgaError::Handler {
                message: format!("handler for {} returned an unexpected response type", R::name()),
                code: None,
                retryable: false,
            }
        })
    }

    /// Fan an event out to every registered handler. Individual handler
    /// failures are isolated and logged; the publish itself only fails
    /// if routing fails.
    pub async fn publish<E: Event>(&self, event: E) -> Result<()> {
        self.publish_with(event, RequestContext::new()).await
    }

    pub async fn publish_with<E: Event>(&self, event: E, ctx: RequestContext) -> Result<()> {
        let handlers = self.registry.event_dispatches(TypeId::of::<E>());
        if handlers.is_empty() {
            debug!(event_type = E::name(), "no handlers registered for event");
            return Ok(());
        }

        let event: Arc<dyn Any + Send + Sync> = Arc::new(event);
        let dispatches = handlers
            .iter()
            .map(|dispatch| dispatch(event.clone(), ctx.clone()));
        let results = futures::future::join_all(dispatches).await;

        for err in results.into_iter().filter_map(|r| r.err()) {
            error!(event_type = E::name(), error = %err, "event handler failed");
        }
        Ok(())
    }

    /// Dispatch each request in order; per-item failures are
    /// independent and results preserve input order.
    pub async fn send_batch<R: Request>(&self, requests: Vec<R>) -> Vec<Result<R::Response>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.send(request).await);
        }
        results
    }

    pub async fn publish_batch<E: Event>(&self, events: Vec<E>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Lazily dispatch each item of `source`, yielding results in input
    /// order. Cancellation is observed between items.
    pub fn send_stream<'a, R, S>(
        &'a self,
        source: S,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<R::Response>> + 'a
    where
        R: Request,
        S: Stream<Item = R> + Send + 'a,
    {
        source.then(move |request| {
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(CatgaError::Cancelled);
                }
                self.send_with(
                    request,
                    RequestContext::new().with_cancellation(cancel),
                )
                .await
            }
        })
    }
}

pub struct MediatorBuilder {
    registry: Arc<HandlerRegistry>,
    behaviors: Vec<Arc<dyn Behavior>>,
}

impl Default for MediatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediatorBuilder {
    pub fn new() -> Self {
        Self { registry: Arc::new(HandlerRegistry::new()), behaviors: Vec::new() }
    }

    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Append a behavior; the first added runs outermost.
    pub fn with_behavior(mut self, behavior: Arc<dyn Behavior>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Assemble the standard pipeline from loaded configuration.
    pub fn with_config(self, config: &catga_config::CatgaConfig) -> Self {
        self.with_default_pipeline(&MediatorOptions::from(config))
    }

    /// Assemble the standard pipeline from the options: logging →
    /// tracing → validation → retry → timeout, outermost first.
    pub fn with_default_pipeline(mut self, options: &MediatorOptions) -> Self {
        if options.enable_logging {
            self.behaviors.push(Arc::new(LoggingBehavior));
        }
        if options.enable_tracing {
            self.behaviors.push(Arc::new(TracingBehavior::new(self.registry.clone())));
        }
        if options.enable_validation {
            self.behaviors.push(Arc::new(ValidationBehavior::new(self.registry.clone())));
        }
        if options.enable_retry {
            self.behaviors.push(Arc::new(RetryBehavior::new(
                options.max_retry_attempts,
                options.retry_delay,
            )));
        }
        if let Some(timeout) = options.timeout {
            self.behaviors.push(Arc::new(TimeoutBehavior::new(timeout)));
        }
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn build(self) -> Mediator {
        Mediator { registry: self.registry, behaviors: self.behaviors }
    }
}
