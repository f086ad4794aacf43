//! Inbox-side consumption: the exactly-once half of the pattern.
//!
//! The dispatcher sits between a transport subscription and the
//! business handler. Each delivery takes the per-MessageId inbox lock;
//! duplicates are dropped, failures leave the lock to expire so the
//! message is redelivered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use catga_core::{MessageEnvelope, Result};
use catga_transport::{DeliveryHandler, Subscription, Transport};

use crate::inbox::{InboxMessage, InboxStore};

/// The business handler invoked behind the inbox lock. The returned
/// bytes are stored as the processing result for replay lookups.
#[async_trait]
pub trait InboxHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<Bytes>;
}

pub struct InboxDispatcher {
    inbox: Arc<dyn InboxStore>,
    handler: Arc<dyn InboxHandler>,
    lock_ttl: Duration,
}

impl InboxDispatcher {
    pub fn new(
        inbox: Arc<dyn InboxStore>,
        handler: Arc<dyn InboxHandler>,
        lock_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { inbox, handler, lock_ttl })
    }

    /// Lock TTL from the `[inbox]` section.
    pub fn from_config(
        inbox: Arc<dyn InboxStore>,
        handler: Arc<dyn InboxHandler>,
        config: &catga_config::InboxConfig,
    ) -> Arc<Self> {
        Self::new(inbox, handler, config.lock_ttl())
    }

    /// Subscribe this dispatcher to a message type on the transport.
    pub async fn attach(
        self: &Arc<Self>,
        transport: &dyn Transport,
        message_type: &str,
    ) -> Result<Subscription> {
        transport.subscribe(message_type, self.delivery_handler()).await
    }

    /// Subscribe this dispatcher to a point-to-point destination.
    pub async fn attach_destination(
        self: &Arc<Self>,
        transport: &dyn Transport,
        destination: &str,
    ) -> Result<Subscription> {
        transport.subscribe_destination(destination, self.delivery_handler()).await
    }

    pub fn delivery_handler(self: &Arc<Self>) -> DeliveryHandler {
        let dispatcher = self.clone();
        Arc::new(move |envelope| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move { dispatcher.on_delivery(envelope).await })
        })
    }

    async fn on_delivery(&self, envelope: MessageEnvelope) -> Result<()> {
        let message_id = envelope.message_id;

        if self.inbox.has_been_processed(message_id).await? {
            debug!(message_id = %message_id, "duplicate delivery, already processed");
            metrics::counter!("catga.inbox.duplicates_total").increment(1);
            return Ok(());
        }

        if !self.inbox.try_lock(message_id, self.lock_ttl).await? {
            debug!(message_id = %message_id, "duplicate delivery, lock held");
            metrics::counter!("catga.inbox.duplicates_total").increment(1);
            return Ok(());
        }

        match self.handler.handle(&envelope).await {
            Ok(result) => {
                let record =
                    InboxMessage::received(message_id, envelope.message_type.clone(), envelope.payload.clone())
                        .processed(Some(result));
                self.inbox.mark_processed(record).await?;
                metrics::counter!("catga.inbox.processed_total").increment(1);
                Ok(())
            }
            Err(e) => {
                // Leave the lock to expire; the redelivery re-acquires it.
                warn!(message_id = %message_id, error = %e, "inbox handler failed");
                metrics::counter!("catga.inbox.failures_total").increment(1);
                Err(e)
            }
        }
    }
}
