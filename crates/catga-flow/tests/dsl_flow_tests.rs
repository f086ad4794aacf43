//! Durable flow tests: step progression and persistence, wait/signal,
//! failure capture, claim-based recovery and wait timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use catga_core::CatgaError;
use catga_flow::{
    DslFlowStatus, DslFlowStore, FlowDefinition, FlowExecutor, FlowSnapshot,
    InMemoryDslFlowStore, StepOutcome, WaitCondition,
};

#[derive(Debug, Clone, Default, PartialEq)]
struct OrderState {
    reserved: bool,
    charged: bool,
    shipped: bool,
}

fn happy_definition() -> FlowDefinition<OrderState> {
    FlowDefinition::new("order")
        .step("reserve", |mut state: OrderState, _ctx| async move {
            state.reserved = true;
            Ok(StepOutcome::Continue(state))
        })
        .step("charge", |mut state: OrderState, _ctx| async move {
            state.charged = true;
            Ok(StepOutcome::Continue(state))
        })
        .step("ship", |mut state: OrderState, _ctx| async move {
            state.shipped = true;
            Ok(StepOutcome::Continue(state))
        })
}

#[tokio::test]
async fn flow_runs_all_steps_and_completes() {
    let store = Arc::new(InMemoryDslFlowStore::new());
    let executor = FlowExecutor::new(store.clone(), happy_definition());

    let cancel = CancellationToken::new();
    let finished = executor.start("o-1", OrderState::default(), &cancel).await.unwrap();

    assert_eq!(finished.status, DslFlowStatus::Completed);
    assert_eq!(finished.current_step, 3);
    assert!(finished.state.reserved && finished.state.charged && finished.state.shipped);

    // The persisted snapshot matches what the executor returned.
    let stored = store.load("o-1").await.unwrap().unwrap();
    assert_eq!(stored.status, DslFlowStatus::Completed);
    assert_eq!(stored.state, finished.state);
}

#[tokio::test]
async fn failing_step_records_error_and_stops() {
    let definition = FlowDefinition::new("order")
        .step("reserve", |mut state: OrderState, _ctx| async move {
            state.reserved = true;
            Ok(StepOutcome::Continue(state))
        })
        .step("charge", |_state: OrderState, _ctx| async move {
            Err(CatgaError::handler("card declined"))
        })
        .step("ship", |state: OrderState, _ctx| async move {
            Ok(StepOutcome::Continue(state))
        });

    let store = Arc::new(InMemoryDslFlowStore::new());
    let executor = FlowExecutor::new(store.clone(), definition);

    let cancel = CancellationToken::new();
    let finished = executor.start("o-1", OrderState::default(), &cancel).await.unwrap();

    assert_eq!(finished.status, DslFlowStatus::Failed);
    assert_eq!(finished.current_step, 1);
    assert!(finished.error.as_deref().unwrap().contains("card declined"));
    assert!(!finished.state.shipped);
}

#[tokio::test]
async fn waiting_flow_resumes_after_signal() {
    let definition = FlowDefinition::new("order")
        .step("reserve", |mut state: OrderState, _ctx| async move {
            state.reserved = true;
            Ok(StepOutcome::Wait {
                state,
                condition: WaitCondition::all("payment-confirmed", 2),
            })
        })
        .step("ship", |mut state: OrderState, _ctx| async move {
            state.shipped = true;
            Ok(StepOutcome::Continue(state))
        });

    let store = Arc::new(InMemoryDslFlowStore::new());
    let executor = FlowExecutor::new(store.clone(), definition);

    let cancel = CancellationToken::new();
    let parked = executor.start("o-1", OrderState::default(), &cancel).await.unwrap();
    assert_eq!(parked.status, DslFlowStatus::Waiting);
    assert!(parked.owner.is_none());

    // First signal is not enough for an All(2) condition.
    assert_eq!(store.signal("payment-confirmed").await.unwrap(), 0);
    assert_eq!(store.load("o-1").await.unwrap().unwrap().status, DslFlowStatus::Waiting);

    assert_eq!(store.signal("payment-confirmed").await.unwrap(), 1);
    assert_eq!(store.load("o-1").await.unwrap().unwrap().status, DslFlowStatus::Running);

    // Any worker can now claim and finish it.
    let finished = executor.resume_one(&cancel).await.unwrap().unwrap();
    assert_eq!(finished.status, DslFlowStatus::Completed);
    assert!(finished.state.shipped);
}

#[tokio::test]
async fn stale_flow_is_claimed_and_continued_from_current_step() {
    let store = Arc::new(InMemoryDslFlowStore::new());

    // A crashed worker left the flow mid-way: step 1 done, heartbeat old.
    let mut abandoned = FlowSnapshot::new("o-9", "order", OrderState {
        reserved: true,
        ..Default::default()
    });
    abandoned.current_step = 1;
    abandoned.owner = Some("dead-worker".into());
    abandoned.heartbeat_at = chrono::Utc::now() - chrono::Duration::minutes(10);
    store.insert(abandoned).await.unwrap();

    let mut flow_config = catga_config::FlowConfig::default();
    flow_config.heartbeat_interval_ms = 50;
    let executor = FlowExecutor::new(store.clone(), happy_definition())
        .with_owner_id("fresh-worker")
        .with_config(&flow_config);

    let cancel = CancellationToken::new();
    let finished = executor.resume_one(&cancel).await.unwrap().expect("flow should be claimable");

    assert_eq!(finished.status, DslFlowStatus::Completed);
    // Step 0 was not re-run: only charge and ship executed.
    assert!(finished.state.charged && finished.state.shipped);
    let stored = store.load("o-9").await.unwrap().unwrap();
    assert_eq!(stored.owner.as_deref(), Some("fresh-worker"));
}

#[tokio::test]
async fn nothing_claimable_returns_none() {
    let store: Arc<InMemoryDslFlowStore<OrderState>> = Arc::new(InMemoryDslFlowStore::new());
    let executor = FlowExecutor::new(store, happy_definition());

    let cancel = CancellationToken::new();
    assert!(executor.resume_one(&cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn timed_out_wait_fails_the_flow() {
    let definition = FlowDefinition::new("order").step(
        "reserve",
        |state: OrderState, _ctx| async move {
            Ok(StepOutcome::Wait {
                state,
                condition: WaitCondition::any("never-arrives")
                    .with_timeout(Duration::from_millis(0)),
            })
        },
    );

    let store = Arc::new(InMemoryDslFlowStore::new());
    let executor = FlowExecutor::new(store.clone(), definition);

    let cancel = CancellationToken::new();
    executor.start("o-1", OrderState::default(), &cancel).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.expire_stale_waits().await.unwrap(), 1);

    let stored = store.load("o-1").await.unwrap().unwrap();
    assert_eq!(stored.status, DslFlowStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn cancelled_flow_persists_cancelled_status() {
    let definition = FlowDefinition::new("order")
        .step("reserve", |mut state: OrderState, _ctx| async move {
            state.reserved = true;
            Ok(StepOutcome::Continue(state))
        })
        .step("ship", |state: OrderState, _ctx| async move {
            Ok(StepOutcome::Continue(state))
        });

    let store = Arc::new(InMemoryDslFlowStore::new());
    let executor = FlowExecutor::new(store.clone(), definition);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let finished = executor.start("o-1", OrderState::default(), &cancel).await.unwrap();

    assert_eq!(finished.status, DslFlowStatus::Cancelled);
    assert_eq!(store.load("o-1").await.unwrap().unwrap().status, DslFlowStatus::Cancelled);
}
