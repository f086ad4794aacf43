//! Durable DSL flows: persisted step sequences that survive worker
//! crashes.
//!
//! A flow advances step by step, persisting a CAS-versioned snapshot
//! after each one. Waiting flows release ownership and resume when the
//! expected signals arrive; a crashed worker's flow goes stale and is
//! claimed by another worker, which continues from `current_step`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use catga_core::{CatgaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DslFlowStatus {
    Running,
    Completed,
    Failed,
    Waiting,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitMode {
    /// Any single matching signal resumes the flow.
    Any,
    /// All `expected_count` signals must arrive.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitCondition {
    pub mode: WaitMode,
    pub expected_count: u32,
    pub received_count: u32,
    pub correlation_id: String,
    pub timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl WaitCondition {
    pub fn any(correlation_id: impl Into<String>) -> Self {
        Self {
            mode: WaitMode::Any,
            expected_count: 1,
            received_count: 0,
            correlation_id: correlation_id.into(),
            timeout: None,
            created_at: Utc::now(),
        }
    }

    pub fn all(correlation_id: impl Into<String>, expected_count: u32) -> Self {
        Self {
            mode: WaitMode::All,
            expected_count,
            received_count: 0,
            correlation_id: correlation_id.into(),
            timeout: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn is_satisfied(&self) -> bool {
        match self.mode {
            WaitMode::Any => self.received_count >= 1,
            WaitMode::All => self.received_count >= self.expected_count,
        }
    }
}

/// Persisted picture of one flow instance.
#[derive(Debug, Clone)]
pub struct FlowSnapshot<S> {
    pub id: String,
    pub flow_type: String,
    pub state: S,
    pub current_step: u32,
    pub status: DslFlowStatus,
    pub error: Option<String>,
    pub wait_condition: Option<WaitCondition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// CAS token: updates must carry version = persisted + 1.
    pub version: u64,
    pub owner: Option<String>,
    pub heartbeat_at: DateTime<Utc>,
}

impl<S> FlowSnapshot<S> {
    pub fn new(id: impl Into<String>, flow_type: impl Into<String>, state: S) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            flow_type: flow_type.into(),
            state,
            current_step: 0,
            status: DslFlowStatus::Running,
            error: None,
            wait_condition: None,
            created_at: now,
            updated_at: now,
            version: 0,
            owner: None,
            heartbeat_at: now,
        }
    }
}

#[async_trait]
pub trait DslFlowStore<S: Clone + Send + Sync + 'static>: Send + Sync {
    async fn insert(&self, snapshot: FlowSnapshot<S>) -> Result<()>;

    async fn load(&self, id: &str) -> Result<Option<FlowSnapshot<S>>>;

    /// Optimistic update: succeeds only if the persisted version equals
    /// `snapshot.version - 1`.
    async fn update(&self, snapshot: FlowSnapshot<S>) -> Result<()>;

    /// Claim a Running flow that is unowned or stale.
    async fn try_claim(
        &self,
        flow_type: &str,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<FlowSnapshot<S>>>;

    async fn heartbeat(&self, id: &str, owner: &str, step: u32) -> Result<()>;

    /// Deliver an external signal to Waiting flows matching the
    /// correlation id. Satisfied conditions flip the flow back to
    /// Running (unowned, ready to claim). Returns how many flows
    /// resumed.
    async fn signal(&self, correlation_id: &str) -> Result<usize>;

    /// Fail Waiting flows whose wait timed out. Returns how many.
    async fn expire_stale_waits(&self) -> Result<usize>;
}

pub struct InMemoryDslFlowStore<S> {
    flows: DashMap<String, FlowSnapshot<S>>,
}

impl<S> Default for InMemoryDslFlowStore<S> {
    fn default() -> Self {
        Self { flows: DashMap::new() }
    }
}

impl<S> InMemoryDslFlowStore<S> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> DslFlowStore<S> for InMemoryDslFlowStore<S> {
    async fn insert(&self, snapshot: FlowSnapshot<S>) -> Result<()> {
        self.flows.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<FlowSnapshot<S>>> {
        Ok(self.flows.get(id).map(|f| f.clone()))
    }

    async fn update(&self, snapshot: FlowSnapshot<S>) -> Result<()> {
        let mut entry = self.flows.get_mut(&snapshot.id).ok_or_else(|| {
            CatgaError::Persistence {
                message: format!("flow {} does not exist", snapshot.id),
                retryable: false,
            }
        })?;
        if entry.version + 1 != snapshot.version {
            return Err(CatgaError::ConcurrencyConflict {
                resource: snapshot.id.clone(),
                expected: snapshot.version as i64 - 1,
                actual: entry.version as i64,
            });
        }
        *entry = snapshot;
        Ok(())
    }

    async fn try_claim(
        &self,
        flow_type: &str,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<FlowSnapshot<S>>> {
        let stale_cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::minutes(1));

        for mut entry in self.flows.iter_mut() {
            let claimable = entry.flow_type == flow_type
                && entry.status == DslFlowStatus::Running
                && (entry.owner.is_none() || entry.heartbeat_at < stale_cutoff);
            if claimable {
                entry.owner = Some(owner.to_string());
                entry.heartbeat_at = Utc::now();
                entry.version += 1;
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    async fn heartbeat(&self, id: &str, owner: &str, step: u32) -> Result<()> {
        let mut entry = self
            .flows
            .get_mut(id)
            .ok_or_else(|| CatgaError::LockLost(id.to_string()))?;
        if entry.owner.as_deref() != Some(owner) {
            return Err(CatgaError::LockLost(id.to_string()));
        }
        entry.heartbeat_at = Utc::now();
        entry.current_step = step;
        Ok(())
    }

    async fn signal(&self, correlation_id: &str) -> Result<usize> {
        let mut resumed = 0;
        for mut entry in self.flows.iter_mut() {
            if entry.status != DslFlowStatus::Waiting {
                continue;
            }
            let Some(condition) = entry.wait_condition.as_mut() else { continue };
            if condition.correlation_id != correlation_id {
                continue;
            }
            condition.received_count += 1;
            if condition.is_satisfied() {
                entry.status = DslFlowStatus::Running;
                entry.wait_condition = None;
                entry.owner = None;
                entry.version += 1;
                entry.updated_at = Utc::now();
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn expire_stale_waits(&self) -> Result<usize> {
        let now = Utc::now();
        let mut expired = 0;
        for mut entry in self.flows.iter_mut() {
            if entry.status != DslFlowStatus::Waiting {
                continue;
            }
            let Some(condition) = &entry.wait_condition else { continue };
            let Some(timeout) = condition.timeout else { continue };
            let deadline = condition.created_at
                + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
            if now > deadline {
                entry.status = DslFlowStatus::Failed;
                entry.error = Some("wait condition timed out".to_string());
                entry.wait_condition = None;
                entry.owner = None;
                entry.version += 1;
                entry.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

/// What a step tells the runtime to do next.
pub enum StepOutcome<S> {
    /// Persist the state and move to the next step.
    Continue(S),
    /// Persist the state and park until the condition is met.
    Wait { state: S, condition: WaitCondition },
    /// Persist the state and finish early.
    Complete(S),
}

#[derive(Debug, Clone)]
pub struct StepContext {
    pub flow_id: String,
    pub step_index: u32,
    pub step_name: String,
}

type StepFuture<S> = Pin<Box<dyn Future<Output = Result<StepOutcome<S>>> + Send>>;
type StepFn<S> = Arc<dyn Fn(S, StepContext) -> StepFuture<S> + Send + Sync>;

/// Ordered step sequence for one flow type.
pub struct FlowDefinition<S> {
    flow_type: String,
    steps: Vec<(String, StepFn<S>)>,
}

impl<S: Clone + Send + Sync + 'static> FlowDefinition<S> {
    pub fn new(flow_type: impl Into<String>) -> Self {
        Self { flow_type: flow_type.into(), steps: Vec::new() }
    }

    pub fn step<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(S, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome<S>>> + Send + 'static,
    {
        self.steps.push((name.into(), Arc::new(move |state, ctx| Box::pin(f(state, ctx)))));
        self
    }

    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Drives flow instances: starts new ones, claims stale ones, runs
/// steps, persists snapshots and heartbeats while working.
pub struct FlowExecutor<S, St>
where
    S: Clone + Send + Sync + 'static,
    St: DslFlowStore<S> + 'static,
{
    store: Arc<St>,
    definition: Arc<FlowDefinition<S>>,
    owner_id: String,
    heartbeat_interval: Duration,
    stale_after: Duration,
}

impl<S, St> FlowExecutor<S, St>
where
    S: Clone + Send + Sync + 'static,
    St: DslFlowStore<S> + 'static,
{
    pub fn new(store: Arc<St>, definition: FlowDefinition<S>) -> Self {
        let defaults = catga_config::FlowConfig::default();
        Self {
            store,
            definition: Arc::new(definition),
            owner_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval: defaults.heartbeat_interval(),
            stale_after: defaults.stale_threshold(),
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.stale_after = stale_after;
        self
    }

    /// Heartbeat cadence and staleness threshold from the `[flow]`
    /// section.
    pub fn with_config(self, config: &catga_config::FlowConfig) -> Self {
        self.with_heartbeat(config.heartbeat_interval(), config.stale_threshold())
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Persist and drive a new flow instance.
    pub async fn start(
        &self,
        id: &str,
        initial: S,
        cancel: &CancellationToken,
    ) -> Result<FlowSnapshot<S>> {
        let mut snapshot = FlowSnapshot::new(id, self.definition.flow_type(), initial);
        snapshot.owner = Some(self.owner_id.clone());
        self.store.insert(snapshot.clone()).await?;
        info!(flow_id = id, flow_type = self.definition.flow_type(), "flow started");
        self.drive(snapshot, cancel).await
    }

    /// Claim one unowned-or-stale flow and continue it from its
    /// persisted step. Returns `None` when nothing is claimable.
    pub async fn resume_one(&self, cancel: &CancellationToken) -> Result<Option<FlowSnapshot<S>>> {
        let claimed = self
            .store
            .try_claim(self.definition.flow_type(), &self.owner_id, self.stale_after)
            .await?;
        match claimed {
            Some(snapshot) => {
                info!(
                    flow_id = %snapshot.id,
                    step = snapshot.current_step,
                    "resuming claimed flow"
                );
                Ok(Some(self.drive(snapshot, cancel).await?))
            }
            None => Ok(None),
        }
    }

    async fn drive(
        &self,
        mut snapshot: FlowSnapshot<S>,
        cancel: &CancellationToken,
    ) -> Result<FlowSnapshot<S>> {
        let heartbeat_token = CancellationToken::new();
        let step_gauge = Arc::new(AtomicU32::new(snapshot.current_step));
        self.spawn_heartbeat(snapshot.id.clone(), step_gauge.clone(), heartbeat_token.clone());

        let result = self.run_steps(&mut snapshot, &step_gauge, cancel).await;
        heartbeat_token.cancel();
        result?;
        Ok(snapshot)
    }

    async fn run_steps(
        &self,
        snapshot: &mut FlowSnapshot<S>,
        step_gauge: &AtomicU32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while snapshot.status == DslFlowStatus::Running {
            if cancel.is_cancelled() {
                snapshot.status = DslFlowStatus::Cancelled;
                self.persist(snapshot).await?;
                return Ok(());
            }
            let index = snapshot.current_step as usize;
            let Some((name, step)) = self.definition.steps.get(index) else {
                snapshot.status = DslFlowStatus::Completed;
                self.persist(snapshot).await?;
                return Ok(());
            };

            debug!(flow_id = %snapshot.id, step = %name, "running flow step");
            let ctx = StepContext {
                flow_id: snapshot.id.clone(),
                step_index: snapshot.current_step,
                step_name: name.clone(),
            };

            match step(snapshot.state.clone(), ctx).await {
                Ok(StepOutcome::Continue(state)) => {
                    snapshot.state = state;
                    snapshot.current_step += 1;
                    step_gauge.store(snapshot.current_step, Ordering::SeqCst);
                    if snapshot.current_step as usize == self.definition.steps.len() {
                        snapshot.status = DslFlowStatus::Completed;
                    }
                    self.persist(snapshot).await?;
                }
                Ok(StepOutcome::Wait { state, condition }) => {
                    snapshot.state = state;
                    // The waiting step is done; resumption continues at
                    // the next one.
                    snapshot.current_step += 1;
                    snapshot.status = DslFlowStatus::Waiting;
                    snapshot.wait_condition = Some(condition);
                    snapshot.owner = None;
                    self.persist(snapshot).await?;
                    return Ok(());
                }
                Ok(StepOutcome::Complete(state)) => {
                    snapshot.state = state;
                    snapshot.status = DslFlowStatus::Completed;
                    self.persist(snapshot).await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(flow_id = %snapshot.id, step = %name, error = %e, "flow step failed");
                    metrics::counter!("catga.flow.step_failures_total").increment(1);
                    snapshot.status = DslFlowStatus::Failed;
                    snapshot.error = Some(e.to_string());
                    self.persist(snapshot).await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn persist(&self, snapshot: &mut FlowSnapshot<S>) -> Result<()> {
        snapshot.version += 1;
        snapshot.updated_at = Utc::now();
        self.store.update(snapshot.clone()).await
    }

    fn spawn_heartbeat(&self, flow_id: String, step: Arc<AtomicU32>, token: CancellationToken) {
        let store = self.store.clone();
        let owner = self.owner_id.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let current = step.load(Ordering::SeqCst);
                        if let Err(e) = store.heartbeat(&flow_id, &owner, current).await {
                            warn!(flow_id = %flow_id, error = %e, "flow heartbeat failed");
                            break;
                        }
                    }
                }
            }
        });
    }
}
