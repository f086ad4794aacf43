//! The message envelope shared by every transported message.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// Delivery guarantee requested by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum QosLevel {
    /// Lowest-latency path, no persistence, no retries. Lost on failure.
    AtMostOnce,
    /// Durable hand-off, retried on publish failure. Duplicates possible.
    #[default]
    AtLeastOnce,
    /// AtLeastOnce plus broker-side dedup and consumer inbox lock.
    ExactlyOnce,
}

/// Envelope wrapping an opaque serialized payload with identity,
/// causality and delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    /// Equal for all messages of one logical operation.
    pub correlation_id: Option<MessageId>,
    /// Direct parent message.
    pub causation_id: Option<MessageId>,
    /// Fully-qualified type identity of the payload.
    pub message_type: String,
    pub qos: QosLevel,
    pub payload: Bytes,
    pub occurred_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(message_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: MessageId::next(),
            correlation_id: None,
            causation_id: None,
            message_type: message_type.into(),
            qos: QosLevel::default(),
            payload: payload.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_correlation(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Record `parent` as the cause: sets the causation id and inherits
    /// the correlation id (falling back to the parent's own message id
    /// when the parent started the operation).
    pub fn caused_by(mut self, parent: &MessageEnvelope) -> Self {
        self.causation_id = Some(parent.message_id);
        self.correlation_id = parent.correlation_id.or(Some(parent.message_id));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causation_inherits_correlation() {
        let root = MessageEnvelope::new("OrderPlaced", Bytes::from_static(b"{}"));
        let child = MessageEnvelope::new("ReserveStock", Bytes::from_static(b"{}")).caused_by(&root);

        assert_eq!(child.causation_id, Some(root.message_id));
        // The root had no correlation id, so the chain correlates on it.
        assert_eq!(child.correlation_id, Some(root.message_id));

        let grandchild =
            MessageEnvelope::new("StockReserved", Bytes::from_static(b"{}")).caused_by(&child);
        assert_eq!(grandchild.correlation_id, Some(root.message_id));
        assert_eq!(grandchild.causation_id, Some(child.message_id));
    }

    #[test]
    fn default_qos_is_at_least_once() {
        let env = MessageEnvelope::new("Ping", Bytes::new());
        assert_eq!(env.qos, QosLevel::AtLeastOnce);
    }

    #[test]
    fn envelope_serde_round_trip() {
        let env = MessageEnvelope::new("Ping", Bytes::from_static(b"\x01\x02"))
            .with_qos(QosLevel::ExactlyOnce);
        let json = serde_json::to_string(&env).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, env.message_id);
        assert_eq!(back.qos, QosLevel::ExactlyOnce);
        assert_eq!(back.payload, env.payload);
    }
}
