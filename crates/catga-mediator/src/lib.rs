//! In-process mediator: routes commands/queries to exactly one handler
//! and events to every subscriber, with a LIFO behavior pipeline
//! (logging, tracing, validation, retry, timeout) around dispatch.
//!
//! Handler resolution is a `TypeId`-keyed map built at registration, so
//! per-call dispatch cost stays O(1).

mod handler;
mod mediator;
mod pipeline;
mod registry;

pub use handler::{
    Event, EventHandler, Request, RequestContext, RequestHandler, Taggable, Validate,
};
pub use mediator::{Mediator, MediatorBuilder, MediatorOptions};
pub use pipeline::{
    Behavior, LoggingBehavior, Next, RequestInfo, RetryBehavior, TimeoutBehavior,
    TracingBehavior, ValidationBehavior,
};
pub use registry::{BoxedResponse, HandlerRegistry, PipelineFuture};
