//! Pending schedule poller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use catga_core::{MessageEnvelope, QosLevel, Result};
use catga_transport::Transport;

use crate::store::{ScheduledMessage, SchedulerStore};

#[derive(Debug, Clone)]
pub struct SchedulePollerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// QoS stamped on dispatched envelopes.
    pub qos: QosLevel,
}

impl Default for SchedulePollerConfig {
    fn default() -> Self {
        Self::from(&catga_config::SchedulerConfig::default())
    }
}

impl From<&catga_config::SchedulerConfig> for SchedulePollerConfig {
    fn from(config: &catga_config::SchedulerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size as usize,
            qos: QosLevel::AtLeastOnce,
        }
    }
}

/// Picks rows with `deliver_at <= now` and publishes them.
///
/// At-least-once: a crash between publish and `mark_delivered` means
/// the next poll dispatches the row again.
pub struct SchedulePoller {
    store: Arc<dyn SchedulerStore>,
    transport: Arc<dyn Transport>,
    config: SchedulePollerConfig,
}

impl SchedulePoller {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        transport: Arc<dyn Transport>,
        config: SchedulePollerConfig,
    ) -> Self {
        Self { store, transport, config }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting schedule poller"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("schedule poller shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll().await {
                        error!(error = %e, "schedule poll failed");
                    }
                }
            }
        }
    }

    /// One polling pass; returns how many schedules were dispatched.
    pub async fn poll(&self) -> Result<usize> {
        let due = self.store.due(Utc::now(), self.config.batch_size).await?;
        if due.is_empty() {
            trace!("no due schedules");
            return Ok(0);
        }
        debug!(count = due.len(), "dispatching due schedules");
        metrics::gauge!("catga.scheduler.due").set(due.len() as f64);

        let mut dispatched = 0;
        for message in due {
            match self.dispatch(&message).await {
                Ok(()) => {
                    self.store.mark_delivered(&message.schedule_id).await?;
                    metrics::counter!("catga.scheduler.dispatched_total").increment(1);
                    dispatched += 1;
                }
                Err(e) => {
                    // Row stays Pending; next poll retries.
                    warn!(
                        schedule_id = %message.schedule_id,
                        error = %e,
                        "schedule dispatch failed"
                    );
                    metrics::counter!("catga.scheduler.dispatch_errors_total").increment(1);
                }
            }
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, message: &ScheduledMessage) -> Result<()> {
        let envelope = MessageEnvelope::new(message.message_type.clone(), message.payload.clone())
            .with_qos(self.config.qos);
        self.transport.publish(envelope).await
    }
}
