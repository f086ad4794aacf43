//! Saga tests: compensation ordering, commit clearing the stack,
//! isolation of compensation failures and nested scopes.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use catga_core::{CatgaError, Result};
use catga_flow::Saga;
use catga_mediator::{HandlerRegistry, Mediator, Request, RequestContext, RequestHandler};

/// Step command: succeeds unless its name is on the failure list.
struct Step {
    name: &'static str,
}

impl Request for Step {
    type Response = ();
}

/// Compensating command, recorded in execution order.
struct Undo {
    name: &'static str,
}

impl Request for Undo {
    type Response = ();
}

#[derive(Default)]
struct Journal {
    executed: Vec<&'static str>,
    compensated: Vec<&'static str>,
    failing_steps: Vec<&'static str>,
    failing_compensations: Vec<&'static str>,
}

struct StepHandler {
    journal: Arc<Mutex<Journal>>,
}

#[async_trait]
impl RequestHandler<Step> for StepHandler {
    async fn handle(&self, request: &Step, _ctx: &RequestContext) -> Result<()> {
        let mut journal = self.journal.lock();
        if journal.failing_steps.contains(&request.name) {
            return Err(CatgaError::handler(format!("step {} failed", request.name)));
        }
        journal.executed.push(request.name);
        Ok(())
    }
}

struct UndoHandler {
    journal: Arc<Mutex<Journal>>,
}

#[async_trait]
impl RequestHandler<Undo> for UndoHandler {
    async fn handle(&self, request: &Undo, _ctx: &RequestContext) -> Result<()> {
        let mut journal = self.journal.lock();
        journal.compensated.push(request.name);
        if journal.failing_compensations.contains(&request.name) {
            return Err(CatgaError::handler(format!("undo {} failed", request.name)));
        }
        Ok(())
    }
}

fn build(journal: Arc<Mutex<Journal>>) -> Mediator {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register::<Step, _>(Arc::new(StepHandler { journal: journal.clone() }));
    registry.register::<Undo, _>(Arc::new(UndoHandler { journal }));
    Mediator::new(registry)
}

#[tokio::test]
async fn failure_compensates_in_reverse_order() {
    let journal = Arc::new(Mutex::new(Journal {
        failing_steps: vec!["c"],
        ..Default::default()
    }));
    let mediator = build(journal.clone());

    let result: Result<()> = Saga::run(&mediator, RequestContext::new(), |saga| async move {
        saga.execute(Step { name: "a" }).await?;
        saga.register_compensation("a", Undo { name: "a" });
        saga.execute(Step { name: "b" }).await?;
        saga.register_compensation("b", Undo { name: "b" });
        // Step c fails; compensations must unwind c-less, b then a.
        saga.execute(Step { name: "c" }).await?;
        saga.register_compensation("c", Undo { name: "c" });
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(CatgaError::Handler { .. })));
    let journal = journal.lock();
    assert_eq!(journal.executed, vec!["a", "b"]);
    assert_eq!(journal.compensated, vec!["b", "a"]);
}

#[tokio::test]
async fn commit_clears_the_compensation_stack() {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let mediator = build(journal.clone());

    let result: Result<u32> = Saga::run(&mediator, RequestContext::new(), |saga| async move {
        saga.execute(Step { name: "a" }).await?;
        saga.register_compensation("a", Undo { name: "a" });
        saga.execute(Step { name: "b" }).await?;
        saga.register_compensation("b", Undo { name: "b" });
        Ok(7)
    })
    .await;

    assert_eq!(result.unwrap(), 7);
    let journal = journal.lock();
    assert_eq!(journal.executed, vec!["a", "b"]);
    assert!(journal.compensated.is_empty());
}

#[tokio::test]
async fn failing_compensation_does_not_stop_the_rest() {
    let journal = Arc::new(Mutex::new(Journal {
        failing_steps: vec!["d"],
        failing_compensations: vec!["c"],
        ..Default::default()
    }));
    let mediator = build(journal.clone());

    let result: Result<()> = Saga::run(&mediator, RequestContext::new(), |saga| async move {
        for name in ["a", "b", "c"] {
            saga.execute(Step { name }).await?;
            saga.register_compensation(name, Undo { name });
        }
        saga.execute(Step { name: "d" }).await?;
        Ok(())
    })
    .await;

    assert!(result.is_err());
    let journal = journal.lock();
    // c's compensation failed but b and a still ran, in LIFO order.
    assert_eq!(journal.compensated, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn cancellation_mid_flow_compensates_executed_steps() {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let mediator = build(journal.clone());

    let cancel = CancellationToken::new();
    let ctx = RequestContext::new().with_cancellation(cancel.clone());

    let result: Result<()> = Saga::run(&mediator, ctx, |saga| async move {
        saga.execute(Step { name: "a" }).await?;
        saga.register_compensation("a", Undo { name: "a" });
        cancel.cancel();
        // The next execute observes cancellation.
        saga.execute(Step { name: "b" }).await?;
        saga.register_compensation("b", Undo { name: "b" });
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(CatgaError::Cancelled)));
    let journal = journal.lock();
    assert_eq!(journal.executed, vec!["a"]);
    assert_eq!(journal.compensated, vec!["a"]);
}

#[tokio::test]
async fn nested_saga_failure_leaves_outer_steps_committed() {
    let journal = Arc::new(Mutex::new(Journal {
        failing_steps: vec!["inner-b"],
        ..Default::default()
    }));
    let mediator = build(journal.clone());

    let result: Result<()> = Saga::run(&mediator, RequestContext::new(), |outer| {
        let mediator = &mediator;
        async move {
            outer.execute(Step { name: "outer-a" }).await?;
            outer.register_compensation("outer-a", Undo { name: "outer-a" });

            // Inner scope fails and compensates itself only.
            let inner: Result<()> =
                Saga::run(mediator, RequestContext::new(), |inner| async move {
                    inner.execute(Step { name: "inner-a" }).await?;
                    inner.register_compensation("inner-a", Undo { name: "inner-a" });
                    inner.execute(Step { name: "inner-b" }).await?;
                    Ok(())
                })
                .await;
            assert!(inner.is_err());

            outer.execute(Step { name: "outer-b" }).await?;
            Ok(())
        }
    })
    .await;

    assert!(result.is_ok());
    let journal = journal.lock();
    assert_eq!(journal.executed, vec!["outer-a", "inner-a", "outer-b"]);
    // Only the inner scope compensated.
    assert_eq!(journal.compensated, vec!["inner-a"]);
}
