//! Polling publisher: drains Pending outbox rows into the transport.
//!
//! Runs on one primary at a time when several instances share a store;
//! the primary flag is flipped by whatever leader election the
//! deployment uses. Rows that exhaust their retries are dead-lettered
//! and abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use catga_core::{
    CallClass, MessageEnvelope, QosLevel, ResiliencePipeline, Result,
};
use catga_transport::Transport;

use crate::dlq::{DeadLetterQueue, DlqEntry};
use crate::outbox::{OutboxMessage, OutboxStore};

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Published rows older than this are swept each poll.
    pub retention: Duration,
    /// QoS stamped on relayed envelopes.
    pub qos: QosLevel,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self::from(&catga_config::OutboxConfig::default())
    }
}

impl From<&catga_config::OutboxConfig> for OutboxRelayConfig {
    fn from(config: &catga_config::OutboxConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size as usize,
            max_retries: config.max_retries,
            retention: config.retention(),
            qos: QosLevel::ExactlyOnce,
        }
    }
}

pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
    dlq: Option<Arc<dyn DeadLetterQueue>>,
    resilience: ResiliencePipeline,
    config: OutboxRelayConfig,
    is_primary: AtomicBool,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        transport: Arc<dyn Transport>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            outbox,
            transport,
            dlq: None,
            resilience: ResiliencePipeline::new(),
            config,
            is_primary: AtomicBool::new(true),
        }
    }

    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn with_resilience(mut self, resilience: ResiliencePipeline) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Flipped by leader election when several relays share one store.
    pub fn set_primary(&self, primary: bool) {
        self.is_primary.store(primary, Ordering::SeqCst);
        if primary {
            info!("outbox relay became primary");
        } else {
            warn!("outbox relay lost primary status");
        }
    }

    /// Poll loop. Runs until the token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "starting outbox relay"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("outbox relay shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if !self.is_primary() {
                        debug!("skipping poll, not primary");
                        continue;
                    }
                    if let Err(e) = self.process_batch(&cancel).await {
                        error!(error = %e, "outbox batch failed");
                    }
                }
            }
        }
    }

    /// One polling pass: publish Pending rows, then sweep retention.
    pub async fn process_batch(&self, cancel: &CancellationToken) -> Result<usize> {
        let pending = self.outbox.get_pending(self.config.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "publishing pending outbox rows");
        metrics::gauge!("catga.outbox.pending").set(pending.len() as f64);

        let mut published = 0usize;
        for row in pending {
            if cancel.is_cancelled() {
                break;
            }
            if self.publish_row(&row, cancel).await {
                published += 1;
            }
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let swept = self.outbox.sweep_published(cutoff).await?;
        if swept > 0 {
            debug!(count = swept, "swept published outbox rows");
        }

        Ok(published)
    }

    async fn publish_row(&self, row: &OutboxMessage, cancel: &CancellationToken) -> bool {
        let envelope = self.envelope_for(row);
        let publish = self
            .resilience
            .execute(CallClass::TransportPublish, "outbox_publish", cancel, || {
                self.transport.publish(envelope.clone())
            })
            .await;

        match publish {
            Ok(()) => {
                if let Err(e) = self.outbox.mark_published(row.message_id).await {
                    // The consumer inbox dedups the re-publish this causes.
                    warn!(message_id = %row.message_id, error = %e, "mark_published failed");
                }
                metrics::counter!("catga.outbox.published_total").increment(1);
                true
            }
            Err(e) => {
                warn!(message_id = %row.message_id, error = %e, "outbox publish failed");
                metrics::counter!("catga.outbox.publish_failures_total").increment(1);
                let retry_count = self
                    .outbox
                    .mark_failed(row.message_id, &e.to_string())
                    .await
                    .unwrap_or(0);
                if retry_count >= self.config.max_retries {
                    self.dead_letter(row, &e.to_string(), retry_count).await;
                }
                false
            }
        }
    }

    async fn dead_letter(&self, row: &OutboxMessage, reason: &str, retry_count: u32) {
        if let Some(dlq) = &self.dlq {
            let entry = DlqEntry {
                message_id: row.message_id,
                original_message_type: row.message_type.clone(),
                payload: row.payload.clone(),
                failure_reason: reason.to_string(),
                retry_count,
                failed_at: Utc::now(),
            };
            if let Err(e) = dlq.send(entry).await {
                error!(message_id = %row.message_id, error = %e, "dead-letter write failed");
                return;
            }
        }
        error!(
            message_id = %row.message_id,
            retry_count,
            "outbox row abandoned after retry exhaustion"
        );
        metrics::counter!("catga.outbox.abandoned_total").increment(1);
        let _ = self.outbox.mark_abandoned(row.message_id).await;
    }

    /// Re-insert a dead-lettered message as a fresh Pending row.
    pub async fn redrive(&self, entry: &DlqEntry) -> Result<()> {
        self.outbox
            .add(OutboxMessage::new(
                entry.message_id,
                entry.original_message_type.clone(),
                entry.payload.clone(),
            ))
            .await?;
        if let Some(dlq) = &self.dlq {
            dlq.remove(entry.message_id).await?;
        }
        info!(message_id = %entry.message_id, "redrove dead-lettered message");
        Ok(())
    }

    fn envelope_for(&self, row: &OutboxMessage) -> MessageEnvelope {
        MessageEnvelope {
            message_id: row.message_id,
            correlation_id: None,
            causation_id: None,
            message_type: row.message_type.clone(),
            qos: self.config.qos,
            payload: row.payload.clone(),
            occurred_at: row.created_at,
        }
    }
}
