//! Catga core types: message envelope, IDs, QoS, the error model,
//! the resilience pipeline, serializer contract and payload compression.
//!
//! Everything else in the workspace builds on this crate. It owns no
//! I/O of its own; stores and transports live in their own crates.

pub mod compression;
pub mod error;
pub mod id;
pub mod logging;
pub mod message;
pub mod resilience;
pub mod serializer;

pub use compression::{CompressionAlgorithm, CompressionConfig};
pub use error::{CatgaError, Result};
pub use id::{IdGenerator, MessageId};
pub use logging::{init_logging, LogFormat, LogOptions};
pub use message::{MessageEnvelope, QosLevel};
pub use resilience::{CallClass, ResiliencePipeline, RetryPolicy};
pub use serializer::{JsonSerializer, Serializer};
