//! Imperative saga: execute steps through the mediator, undo with a
//! LIFO compensation stack.
//!
//! `Saga::run` is the scoped entry point: it commits on success and
//! compensates on failure or cancellation, so compensation runs on
//! every non-commit exit path.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use catga_core::{CatgaError, Result};
use catga_mediator::{Mediator, Request, RequestContext};

type CompensationFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
type CompensationFn<'a> =
    Box<dyn FnOnce(&'a Mediator, RequestContext) -> CompensationFuture<'a> + Send + 'a>;

struct NamedCompensation<'a> {
    step: &'static str,
    run: CompensationFn<'a>,
}

pub struct Saga<'a> {
    mediator: &'a Mediator,
    ctx: RequestContext,
    compensations: Mutex<Vec<NamedCompensation<'a>>>,
    executed_steps: AtomicU32,
    committed: AtomicBool,
}

impl<'a> Saga<'a> {
    pub fn new(mediator: &'a Mediator) -> Self {
        Self::with_context(mediator, RequestContext::new())
    }

    pub fn with_context(mediator: &'a Mediator, ctx: RequestContext) -> Self {
        Self {
            mediator,
            ctx,
            compensations: Mutex::new(Vec::new()),
            executed_steps: AtomicU32::new(0),
            committed: AtomicBool::new(false),
        }
    }

    /// Dispatch a command; success records the step, failure
    /// immediately compensates everything executed so far.
    pub async fn execute<C: Request>(&self, command: C) -> Result<C::Response> {
        if self.ctx.cancellation.is_cancelled() {
            self.compensate().await;
            return Err(CatgaError::Cancelled);
        }
        match self.mediator.send_with(command, self.ctx.clone()).await {
            Ok(response) => {
                self.executed_steps.fetch_add(1, Ordering::SeqCst);
                Ok(response)
            }
            Err(e) => {
                warn!(error = %e, "saga step failed, compensating");
                self.compensate().await;
                Err(e)
            }
        }
    }

    /// Push a compensating command; it dispatches through the mediator
    /// if the saga unwinds.
    pub fn register_compensation<C>(&self, step: &'static str, command: C)
    where
        C: Request,
    {
        let run: CompensationFn<'a> = Box::new(move |mediator, ctx| {
            Box::pin(async move { mediator.send_with(command, ctx).await.map(|_| ()) })
        });
        self.compensations.lock().push(NamedCompensation { step, run });
    }

    pub fn executed_steps(&self) -> u32 {
        self.executed_steps.load(Ordering::SeqCst)
    }

    /// Mark the saga successful and clear the compensation stack.
    pub fn commit(&self) {
        self.committed.store(true, Ordering::SeqCst);
        let cleared = {
            let mut stack = self.compensations.lock();
            let n = stack.len();
            stack.clear();
            n
        };
        debug!(compensations_cleared = cleared, "saga committed");
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Run compensations in LIFO order. A failing compensation is
    /// recorded and the remaining ones still run.
    pub async fn compensate(&self) {
        loop {
            let next = self.compensations.lock().pop();
            let Some(compensation) = next else { break };

            debug!(step = compensation.step, "running compensation");
            metrics::counter!("catga.saga.compensations_total").increment(1);
            // Compensations run even when the original context was
            // cancelled, on a detached context.
            let mut ctx = RequestContext::new();
            ctx.correlation_id = self.ctx.correlation_id;
            if let Err(e) = (compensation.run)(self.mediator, ctx).await {
                error!(step = compensation.step, error = %e, "compensation failed");
                metrics::counter!("catga.saga.compensation_failures_total").increment(1);
            }
        }
    }

    /// Scoped runner: commits when `body` succeeds, compensates when it
    /// fails or the context is cancelled mid-flight.
    pub async fn run<T, F, Fut>(mediator: &'a Mediator, ctx: RequestContext, body: F) -> Result<T>
    where
        F: FnOnce(std::sync::Arc<Saga<'a>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cancellation = ctx.cancellation.clone();
        let saga = std::sync::Arc::new(Saga::with_context(mediator, ctx));

        let outcome = tokio::select! {
            result = body(saga.clone()) => result,
            _ = cancellation.cancelled() => Err(CatgaError::Cancelled),
        };

        match outcome {
            Ok(value) => {
                saga.commit();
                info!(steps = saga.executed_steps(), "saga completed");
                Ok(value)
            }
            Err(e) => {
                saga.compensate().await;
                Err(e)
            }
        }
    }
}

impl Drop for Saga<'_> {
    fn drop(&mut self) {
        if !self.is_committed() {
            let remaining = self.compensations.lock().len();
            if remaining > 0 {
                // Drop cannot await; this saga escaped both commit and
                // compensate.
                warn!(remaining, "saga dropped with unexecuted compensations");
            }
        }
    }
}
