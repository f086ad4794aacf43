//! Coarse flow state: claim + heartbeat + CAS updates.
//!
//! One worker owns a flow at a time. Ownership is taken by claiming a
//! flow whose heartbeat has gone stale, and kept by heartbeating more
//! often than the staleness threshold.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use catga_core::{CatgaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub id: String,
    pub flow_type: String,
    pub status: FlowStatus,
    pub step: u32,
    /// CAS token: updates must carry version = persisted + 1.
    pub version: u64,
    pub owner: Option<String>,
    pub heartbeat_at: DateTime<Utc>,
}

impl FlowState {
    pub fn new(id: impl Into<String>, flow_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flow_type: flow_type.into(),
            status: FlowStatus::Running,
            step: 0,
            version: 0,
            owner: None,
            heartbeat_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn create(&self, state: FlowState) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<FlowState>>;

    /// Optimistic update: succeeds only if the persisted version equals
    /// `state.version - 1`.
    async fn update(&self, state: FlowState) -> Result<()>;

    /// Claim a Running flow of `flow_type` whose heartbeat is older
    /// than `stale_after` (or that has no owner yet): atomically sets
    /// the owner and refreshes the heartbeat.
    async fn try_claim(
        &self,
        flow_type: &str,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<FlowState>>;

    /// Refresh ownership. Fails with `LockLost` when the caller no
    /// longer owns the flow.
    async fn heartbeat(&self, id: &str, owner: &str, step: u32) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<String, FlowState>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create(&self, state: FlowState) -> Result<()> {
        self.flows.insert(state.id.clone(), state);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FlowState>> {
        Ok(self.flows.get(id).map(|f| f.clone()))
    }

    async fn update(&self, state: FlowState) -> Result<()> {
        let mut entry = self.flows.get_mut(&state.id).ok_or_else(|| {
            CatgaError::Persistence {
                message: format!("flow {} does not exist", state.id),
                retryable: false,
            }
        })?;
        if entry.version + 1 != state.version {
            return Err(CatgaError::ConcurrencyConflict {
                resource: state.id.clone(),
                expected: state.version as i64 - 1,
                actual: entry.version as i64,
            });
        }
        *entry = state;
        Ok(())
    }

    async fn try_claim(
        &self,
        flow_type: &str,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<FlowState>> {
        let stale_cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::minutes(1));

        for mut entry in self.flows.iter_mut() {
            let claimable = entry.flow_type == flow_type
                && entry.status == FlowStatus::Running
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
        entry.step = step;
        Ok(())
    }
}
