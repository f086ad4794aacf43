//! In-process transport backend.
//!
//! Pub/sub topics fan out to every live subscriber; point-to-point
//! destinations buffer until a consumer joins and then round-robin
//! across competing consumers. ExactlyOnce publishes are deduplicated
//! by MessageId within a bounded window, standing in for broker-side
//! dedup.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use catga_core::{CatgaError, MessageEnvelope, MessageId, QosLevel, Result};

use crate::subscription::Subscription;
use crate::{DeliveryHandler, Transport};

#[derive(Debug, Clone)]
pub struct InMemoryTransportConfig {
    /// How many recent MessageIds the ExactlyOnce dedup window retains.
    pub dedup_window: usize,
}

impl Default for InMemoryTransportConfig {
    fn default() -> Self {
        Self { dedup_window: 1024 }
    }
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<MessageEnvelope>,
}

#[derive(Default)]
struct Destination {
    /// Messages sent before any consumer joined.
    buffer: VecDeque<MessageEnvelope>,
    subscribers: Vec<SubscriberEntry>,
    /// Round-robin cursor across competing consumers.
    next: usize,
}

struct DedupWindow {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), capacity }
    }

    /// Returns false if the id was already inside the window.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

struct Inner {
    topics: DashMap<String, Vec<SubscriberEntry>>,
    destinations: DashMap<String, Destination>,
    dedup: Mutex<DedupWindow>,
    next_subscription_id: AtomicU64,
}

#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(InMemoryTransportConfig::default())
    }
}

impl InMemoryTransport {
    pub fn new(config: InMemoryTransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                destinations: DashMap::new(),
                dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    fn spawn_worker(
        handler: DeliveryHandler,
        mut rx: mpsc::UnboundedReceiver<MessageEnvelope>,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        Some(envelope) => {
                            let message_id = envelope.message_id;
                            if let Err(e) = handler(envelope).await {
                                warn!(message_id = %message_id, error = %e, "delivery callback failed");
                                metrics::counter!("catga.transport.delivery_failures_total")
                                    .increment(1);
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<()> {
        if envelope.qos == QosLevel::ExactlyOnce
            && !self.inner.dedup.lock().insert(envelope.message_id)
        {
            debug!(message_id = %envelope.message_id, "duplicate ExactlyOnce publish dropped");
            metrics::counter!("catga.transport.dedup_dropped_total").increment(1);
            return Ok(());
        }

        if let Some(mut subscribers) = self.inner.topics.get_mut(&envelope.message_type) {
            subscribers.retain(|entry| entry.tx.send(envelope.clone()).is_ok());
        } else if envelope.qos != QosLevel::AtMostOnce {
            debug!(
                message_type = %envelope.message_type,
                "publish with no active subscribers"
            );
        }
        metrics::counter!("catga.transport.published_total").increment(1);
        Ok(())
    }

    async fn send(&self, envelope: MessageEnvelope, destination: &str) -> Result<()> {
        let mut dest = self.inner.destinations.entry(destination.to_string()).or_default();

        // Round-robin over live consumers, dropping dead ones as we go.
        while !dest.subscribers.is_empty() {
            let idx = dest.next % dest.subscribers.len();
            if dest.subscribers[idx].tx.send(envelope.clone()).is_ok() {
                dest.next = dest.next.wrapping_add(1);
                metrics::counter!("catga.transport.sent_total").increment(1);
                return Ok(());
            }
            dest.subscribers.remove(idx);
        }

        // No consumer yet: keep it until one joins.
        dest.buffer.push_back(envelope);
        metrics::counter!("catga.transport.sent_total").increment(1);
        Ok(())
    }

    async fn publish_batch(&self, envelopes: Vec<MessageEnvelope>) -> Result<()> {
        let total = envelopes.len();
        let mut failed = Vec::new();
        for envelope in envelopes {
            let message_id = envelope.message_id;
            if self.publish(envelope).await.is_err() {
                failed.push(message_id);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CatgaError::PartialBatch { total, failed })
        }
    }

    async fn subscribe(
        &self,
        message_type: &str,
        handler: DeliveryHandler,
    ) -> Result<Subscription> {
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        self.inner
            .topics
            .entry(message_type.to_string())
            .or_default()
            .push(SubscriberEntry { id, tx });

        Self::spawn_worker(handler, rx, token.clone());

        let inner = self.inner.clone();
        let key = message_type.to_string();
        Ok(Subscription::new(id, token, move || {
            if let Some(mut subscribers) = inner.topics.get_mut(&key) {
                subscribers.retain(|entry| entry.id != id);
            }
        }))
    }

    async fn subscribe_destination(
        &self,
        destination: &str,
        handler: DeliveryHandler,
    ) -> Result<Subscription> {
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        {
            let mut dest = self.inner.destinations.entry(destination.to_string()).or_default();
            // Hand the backlog to the first consumer that shows up.
            while let Some(envelope) = dest.buffer.pop_front() {
                let _ = tx.send(envelope);
            }
            dest.subscribers.push(SubscriberEntry { id, tx });
        }

        Self::spawn_worker(handler, rx, token.clone());

        let inner = self.inner.clone();
        let key = destination.to_string();
        Ok(Subscription::new(id, token, move || {
            if let Some(mut dest) = inner.destinations.get_mut(&key) {
                dest.subscribers.retain(|entry| entry.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn envelope(message_type: &str, qos: QosLevel) -> MessageEnvelope {
        MessageEnvelope::new(message_type, Bytes::from_static(b"{}")).with_qos(qos)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn pub_sub_fans_out_to_all_subscribers() {
        let transport = InMemoryTransport::default();
        let count = Arc::new(AtomicU32::new(0));

        let c1 = count.clone();
        let _s1 = transport
            .subscribe("OrderPlaced", handler_fn(move |_| {
                let c = c1.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();
        let c2 = count.clone();
        let _s2 = transport
            .subscribe("OrderPlaced", handler_fn(move |_| {
                let c = c2.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        transport.publish(envelope("OrderPlaced", QosLevel::AtLeastOnce)).await.unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn point_to_point_delivers_to_exactly_one_consumer() {
        let transport = InMemoryTransport::default();
        let count = Arc::new(AtomicU32::new(0));

        let mut subs = Vec::new();
        for _ in 0..2 {
            let c = count.clone();
            let sub = transport
                .subscribe_destination("orders", handler_fn(move |_| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .await
                .unwrap();
            subs.push(sub);
        }

        for _ in 0..10 {
            transport
                .send(envelope("Job", QosLevel::AtLeastOnce), "orders")
                .await
                .unwrap();
        }
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn send_buffers_until_a_consumer_joins() {
        let transport = InMemoryTransport::default();
        transport.send(envelope("Job", QosLevel::AtLeastOnce), "work").await.unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _sub = transport
            .subscribe_destination("work", handler_fn(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exactly_once_dedups_repeated_publishes() {
        let transport = InMemoryTransport::default();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let _sub = transport
            .subscribe("Payment", handler_fn(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        let env = envelope("Payment", QosLevel::ExactlyOnce);
        transport.publish(env.clone()).await.unwrap();
        transport.publish(env).await.unwrap();

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn at_least_once_redelivers_same_id() {
        // Without ExactlyOnce the transport does not dedup: both
        // publishes arrive and the consumer is expected to handle
        // duplicates itself.
        let transport = InMemoryTransport::default();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let _sub = transport
            .subscribe("Payment", handler_fn(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        let env = envelope("Payment", QosLevel::AtLeastOnce);
        transport.publish(env.clone()).await.unwrap();
        transport.publish(env).await.unwrap();

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_batch_delivers_every_envelope() {
        let transport = InMemoryTransport::default();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let _sub = transport
            .subscribe("Bulk", handler_fn(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        let batch: Vec<MessageEnvelope> =
            (0..10).map(|_| envelope("Bulk", QosLevel::AtLeastOnce)).collect();
        transport.publish_batch(batch).await.unwrap();

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let transport = InMemoryTransport::default();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let sub = transport
            .subscribe("Tick", handler_fn(move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        transport.publish(envelope("Tick", QosLevel::AtLeastOnce)).await.unwrap();
        settle().await;
        drop(sub);

        transport.publish(envelope("Tick", QosLevel::AtLeastOnce)).await.unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ordering_preserved_per_destination() {
        let transport = InMemoryTransport::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let _sub = transport
            .subscribe_destination("ordered", handler_fn(move |env: MessageEnvelope| {
                let s = s.clone();
                async move {
                    s.lock().push(env.message_id);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        let mut expected = Vec::new();
        for _ in 0..20 {
            let env = envelope("Seq", QosLevel::AtLeastOnce);
            expected.push(env.message_id);
            transport.send(env, "ordered").await.unwrap();
        }

        settle().await;
        assert_eq!(*seen.lock(), expected);
    }
}
