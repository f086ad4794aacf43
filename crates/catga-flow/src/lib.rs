//! Saga and durable flow orchestration.
//!
//! [`Saga`] is the in-process shape: steps dispatched through the
//! mediator with a LIFO compensation stack. The [`dsl`] module is the
//! durable shape: persisted step flows claimed and heartbeat by one
//! worker at a time, surviving restarts.

pub mod dsl;
pub mod saga;
pub mod store;

pub use dsl::{
    DslFlowStatus, DslFlowStore, FlowDefinition, FlowExecutor, FlowSnapshot,
    InMemoryDslFlowStore, StepContext, StepOutcome, WaitCondition, WaitMode,
};
pub use saga::Saga;
pub use store::{FlowState, FlowStatus, FlowStore, InMemoryFlowStore};
