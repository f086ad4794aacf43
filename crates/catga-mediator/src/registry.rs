//! Type-keyed handler registry with erased O(1) dispatch.
//!
//! Handlers register under the request's `TypeId`; dispatch downcasts
//! through `Any` inside a closure monomorphized at registration, so the
//! per-call cost is a map lookup plus a virtual call. Handler panics
//! are caught here and surfaced as handler failures.

use std::any::{Any, TypeId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tracing::warn;

use catga_core::{CatgaError, Result};

use crate::handler::{
    Event, EventHandler, Request, RequestContext, RequestHandler, Taggable, Validate,
};

pub type BoxedResponse = Box<dyn Any + Send>;
pub type PipelineFuture = Pin<Box<dyn Future<Output = Result<BoxedResponse>> + Send>>;
type EventFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub(crate) type RequestDispatchFn =
    Arc<dyn Fn(Arc<dyn Any + Send + Sync>, RequestContext) -> PipelineFuture + Send + Sync>;
pub(crate) type EventDispatchFn =
    Arc<dyn Fn(Arc<dyn Any + Send + Sync>, RequestContext) -> EventFuture + Send + Sync>;
pub(crate) type ValidatorFn = Arc<dyn Fn(&dyn Any) -> Result<()> + Send + Sync>;
pub(crate) type TagFn = Arc<dyn Fn(&dyn Any) -> Vec<(String, String)> + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    requests: DashMap<TypeId, RequestDispatchFn>,
    events: DashMap<TypeId, Vec<EventDispatchFn>>,
    validators: DashMap<TypeId, ValidatorFn>,
    request_tags: DashMap<TypeId, TagFn>,
    response_tags: DashMap<TypeId, TagFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton handler for `R`. A later registration for
    /// the same request type replaces the earlier one.
    pub fn register<R, H>(&self, handler: Arc<H>)
    where
        R: Request,
        H: RequestHandler<R> + 'static,
    {
        let f: RequestDispatchFn = Arc::new(move |request, ctx| {
            let handler = handler.clone();
            Box::pin(run_request(handler, request, ctx))
        });
        if self.requests.insert(TypeId::of::<R>(), f).is_some() {
            warn!(request_type = R::name(), "replacing previously registered handler");
        }
    }

    /// Register a scoped handler: the factory runs once per dispatch.
    pub fn register_scoped<R, H, F>(&self, factory: F)
    where
        R: Request,
        H: RequestHandler<R> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let f: RequestDispatchFn = Arc::new(move |request, ctx| {
            let handler = Arc::new(factory());
            Box::pin(run_request(handler, request, ctx))
        });
        if self.requests.insert(TypeId::of::<R>(), f).is_some() {
            warn!(request_type = R::name(), "replacing previously registered handler");
        }
    }

    /// Register an additional event handler for `E`.
    pub fn register_event<E, H>(&self, handler: Arc<H>)
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let f: EventDispatchFn = Arc::new(move |event, ctx| {
            let handler = handler.clone();
            Box::pin(run_event(handler, event, ctx))
        });
        self.events.entry(TypeId::of::<E>()).or_default().push(f);
    }

    /// Register a scoped event handler: the factory runs once per publish.
    pub fn register_event_scoped<E, H, F>(&self, factory: F)
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let f: EventDispatchFn = Arc::new(move |event, ctx| {
            let handler = Arc::new(factory());
            Box::pin(run_event(handler, event, ctx))
        });
        self.events.entry(TypeId::of::<E>()).or_default().push(f);
    }

    /// Wire `R`'s [`Validate`] impl into the validation behavior.
    pub fn register_validator<R>(&self)
    where
        R: Request + Validate,
    {
        let f: ValidatorFn = Arc::new(|request| match request.downcast_ref::<R>() {
            Some(r) => r.validate(),
            None => Ok(()),
        });
        self.validators.insert(TypeId::of::<R>(), f);
    }

    /// Declare span tags for the request type.
    pub fn register_request_tags<R>(&self)
    where
        R: Request + Taggable,
    {
        let f: TagFn = Arc::new(|request| match request.downcast_ref::<R>() {
            Some(r) => r.tags().into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            None => Vec::new(),
        });
        self.request_tags.insert(TypeId::of::<R>(), f);
    }

    /// Declare span tags for the response of `R`.
    pub fn register_response_tags<R>(&self)
    where
        R: Request,
        R::Response: Taggable,
    {
        let f: TagFn = Arc::new(|response| match response.downcast_ref::<R::Response>() {
            Some(r) => r.tags().into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            None => Vec::new(),
        });
        self.response_tags.insert(TypeId::of::<R>(), f);
    }

    pub(crate) fn request_dispatch(&self, type_id: TypeId) -> Option<RequestDispatchFn> {
        self.requests.get(&type_id).map(|f| f.clone())
    }

    pub(crate) fn event_dispatches(&self, type_id: TypeId) -> Vec<EventDispatchFn> {
        self.events.get(&type_id).map(|v| v.clone()).unwrap_or_default()
    }

    pub(crate) fn validator(&self, type_id: TypeId) -> Option<ValidatorFn> {
        self.validators.get(&type_id).map(|f| f.clone())
    }

    pub(crate) fn request_tag_fn(&self, type_id: TypeId) -> Option<TagFn> {
        self.request_tags.get(&type_id).map(|f| f.clone())
    }

    pub(crate) fn response_tag_fn(&self, type_id: TypeId) -> Option<TagFn> {
        self.response_tags.get(&type_id).map(|f| f.clone())
    }

    pub fn has_handler(&self, type_id: TypeId) -> bool {
        self.requests.contains_key(&type_id)
    }
}

async fn run_request<R, H>(
    handler: Arc<H>,
    request: Arc<dyn Any + Send + Sync>,
    ctx: RequestContext,
) -> Result<BoxedResponse>
where
    R: Request,
    H: RequestHandler<R> + 'static,
{
    let request = request
        .downcast::<R>()
        .map_err(|_| CatgaError::NoHandler(R::name().to_string()))?;

    let fut = std::panic::AssertUnwindSafe(handler.handle(&request, &ctx)).catch_unwind();
    match fut.await {
        Ok(Ok(response)) => Ok(Box::new(response) as BoxedResponse),
        Ok(Err(e)) => Err(e),
        Err(panic) => Err(CatgaError::Handler {
            message: panic_message(panic),
            code: None,
            retryable: false,
        }),
    }
}

async fn run_event<E, H>(
    handler: Arc<H>,
    event: Arc<dyn Any + Send + Sync>,
    ctx: RequestContext,
) -> Result<()>
where
    E: Event,
    H: EventHandler<E> + 'static,
{
    let event = event
        .downcast::<E>()
        .map_err(|_| CatgaError::NoHandler(E::name().to_string()))?;

    let fut = std::panic::AssertUnwindSafe(handler.handle(&event, &ctx)).catch_unwind();
    match fut.await {
        Ok(result) => result,
        Err(panic) => Err(CatgaError::Handler {
            message: panic_message(panic),
            code: None,
            retryable: false,
        }),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
