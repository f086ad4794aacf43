//! Transport layer: publish/send/subscribe with QoS levels.
//!
//! The contract is backend-agnostic; the in-memory backend lives in
//! [`memory`], networked backends implement the same trait elsewhere.
//! Ordering is only guaranteed for one producer sending to one
//! destination on an ordered backend; pub/sub gives no ordering.

pub mod memory;
mod subscription;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use catga_core::{MessageEnvelope, Result};

pub use memory::{InMemoryTransport, InMemoryTransportConfig};
pub use subscription::Subscription;

/// Future returned by a delivery callback.
pub type DeliveryFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Callback invoked for each delivered message. Callbacks run
/// concurrently across messages; a callback error leaves redelivery up
/// to the backend's QoS.
pub type DeliveryHandler = Arc<dyn Fn(MessageEnvelope) -> DeliveryFuture + Send + Sync>;

/// Build a [`DeliveryHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> DeliveryHandler
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fan-out delivery to every subscriber of the envelope's message
    /// type, honoring its QoS level.
    async fn publish(&self, envelope: MessageEnvelope) -> Result<()>;

    /// Point-to-point delivery: exactly one consumer of `destination`
    /// receives the message.
    async fn send(&self, envelope: MessageEnvelope, destination: &str) -> Result<()>;

    /// Best-effort batch publish. Already-published items stay
    /// published; a partial failure error enumerates the MessageIds
    /// that did not ship.
    async fn publish_batch(&self, envelopes: Vec<MessageEnvelope>) -> Result<()>;

    /// Register a delivery callback for a message type. Delivery stops
    /// when the returned handle is dropped; in-flight callbacks finish.
    async fn subscribe(&self, message_type: &str, handler: DeliveryHandler)
        -> Result<Subscription>;

    /// Join the competing consumers of a point-to-point destination.
    async fn subscribe_destination(
        &self,
        destination: &str,
        handler: DeliveryHandler,
    ) -> Result<Subscription>;
}
