//! Catga configuration system.
//!
//! TOML-based configuration with environment variable override support.
//! Every section has working defaults, so an empty file (or no file at
//! all) yields a usable configuration, and every section knows how to
//! produce the runtime pieces it describes: retry sections become
//! [`RetryPolicy`]s, the resilience block builds a
//! [`ResiliencePipeline`], the logging block drives
//! [`catga_core::init_logging`], and the component crates build their
//! option structs from the matching sections here.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use catga_core::{
    CallClass, CompressionAlgorithm, CompressionConfig, LogFormat, LogOptions,
    ResiliencePipeline, RetryPolicy,
};

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root configuration for the Catga runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CatgaConfig {
    pub logging: LoggingSection,
    pub mediator: MediatorConfig,
    pub resilience: ResilienceConfig,
    pub idempotency: IdempotencyConfig,
    pub inbox: InboxConfig,
    pub outbox: OutboxConfig,
    pub scheduler: SchedulerConfig,
    pub snapshot: SnapshotConfig,
    pub flow: FlowConfig,
    pub compression: CompressionSection,
}

impl CatgaConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CatgaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idempotency.shard_count == 0 {
            return Err(ConfigError::ValidationError(
                "idempotency.shard_count must be at least 1".into(),
            ));
        }
        if self.flow.stale_threshold_ms <= self.flow.heartbeat_interval_ms {
            return Err(ConfigError::ValidationError(
                "flow.stale_threshold_ms must exceed flow.heartbeat_interval_ms".into(),
            ));
        }
        if self.mediator.max_retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "mediator.max_retry_attempts must be at least 1".into(),
            ));
        }
        if self.compression.parse_algorithm().is_none() {
            return Err(ConfigError::ValidationError(format!(
                "compression.algorithm must be gzip, brotli or deflate, got {:?}",
                self.compression.algorithm
            )));
        }
        Ok(())
    }

    /// Install the tracing subscriber described by `[logging]`.
    pub fn init_logging(&self) {
        catga_core::init_logging(&self.logging.options());
    }
}

/// Output format and filter for the tracing subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// "text" or "json".
    pub format: String,
    /// Filter directive, e.g. "info" or "catga_outbox=debug,info".
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { format: "text".into(), filter: "info".into() }
    }
}

impl LoggingSection {
    pub fn options(&self) -> LogOptions {
        let format = if self.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        };
        LogOptions { format, filter: self.filter.clone() }
    }
}

/// Pipeline feature toggles and global dispatch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    pub enable_logging: bool,
    pub enable_tracing: bool,
    pub enable_validation: bool,
    pub enable_retry: bool,
    pub enable_idempotency: bool,
    pub enable_dead_letter_queue: bool,
    pub max_retry_attempts: u32,
    pub timeout_seconds: u64,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
            enable_tracing: true,
            enable_validation: true,
            enable_retry: true,
            enable_idempotency: false,
            enable_dead_letter_queue: true,
            max_retry_attempts: 3,
            timeout_seconds: 30,
        }
    }
}

impl MediatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// One retry/timeout policy per call class.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    pub mediator: RetrySection,
    pub transport_publish: RetrySection,
    pub transport_send: RetrySection,
    pub persistence: RetrySection,
}

impl ResilienceConfig {
    /// Build the resilience pipeline with one policy per call class.
    pub fn pipeline(&self) -> ResiliencePipeline {
        ResiliencePipeline::new()
            .with_policy(CallClass::Mediator, self.mediator.policy())
            .with_policy(CallClass::TransportPublish, self.transport_publish.policy())
            .with_policy(CallClass::TransportSend, self.transport_send.policy())
            .with_policy(CallClass::Persistence, self.persistence.policy())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Total attempts including the first.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub timeout_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self { retry_count: 3, retry_delay_ms: 100, backoff_multiplier: 2.0, timeout_ms: 30_000 }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_count.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            timeout: Some(Duration::from_millis(self.timeout_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub shard_count: usize,
    pub ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { shard_count: 16, ttl_seconds: 3600 }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Must cover handler latency plus clock skew.
    pub lock_ttl_seconds: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self { lock_ttl_seconds: 30 }
    }
}

impl InboxConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub max_retries: u32,
    /// Published rows older than this are swept by retention.
    pub retention_seconds: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 500, batch_size: 100, max_retries: 5, retention_seconds: 86_400 }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1000, batch_size: 100 }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Informational hint: snapshot roughly every N events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub frequency: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { frequency: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub heartbeat_interval_ms: u64,
    /// A flow whose heartbeat is older than this is claimable.
    pub stale_threshold_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self { heartbeat_interval_ms: 5_000, stale_threshold_ms: 60_000 }
    }
}

impl FlowConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    /// "gzip", "brotli" or "deflate".
    pub algorithm: String,
    pub min_size_bytes: usize,
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self { algorithm: "gzip".into(), min_size_bytes: 1024 }
    }
}

impl CompressionSection {
    fn parse_algorithm(&self) -> Option<CompressionAlgorithm> {
        match self.algorithm.to_ascii_lowercase().as_str() {
            "gzip" => Some(CompressionAlgorithm::Gzip),
            "brotli" => Some(CompressionAlgorithm::Brotli),
            "deflate" => Some(CompressionAlgorithm::Deflate),
            _ => None,
        }
    }

    /// Unknown algorithm names were rejected by validation, so this
    /// falls back to the default only for unvalidated configs.
    pub fn to_config(&self) -> CompressionConfig {
        CompressionConfig {
            algorithm: self.parse_algorithm().unwrap_or_default(),
            min_size_bytes: self.min_size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CatgaConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.mediator.enable_logging);
        assert_eq!(config.idempotency.shard_count, 16);
        assert_eq!(config.flow.stale_threshold_ms, 60_000);
    }

    #[test]
    fn rejects_zero_shards() {
        let mut config = CatgaConfig::default();
        config.idempotency.shard_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn rejects_stale_threshold_below_heartbeat() {
        let mut config = CatgaConfig::default();
        config.flow.stale_threshold_ms = config.flow.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_compression_algorithm() {
        let mut config = CatgaConfig::default();
        config.compression.algorithm = "zstd".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config: CatgaConfig = toml::from_str(
            r#"
            [outbox]
            poll_interval_ms = 250
            batch_size = 32

            [compression]
            algorithm = "brotli"
            "#,
        )
        .unwrap();
        assert_eq!(config.outbox.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.outbox.batch_size, 32);
        assert_eq!(config.compression.to_config().algorithm, CompressionAlgorithm::Brotli);
        // Untouched sections keep defaults.
        assert_eq!(config.scheduler.poll_interval_ms, 1000);
    }

    #[test]
    fn retry_section_becomes_a_policy() {
        let section = RetrySection {
            retry_count: 7,
            retry_delay_ms: 250,
            backoff_multiplier: 1.5,
            timeout_ms: 5_000,
        };
        let policy = section.policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.retry_delay, Duration::from_millis(250));
        assert_eq!(policy.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn resilience_block_builds_per_class_policies() {
        let mut config = ResilienceConfig::default();
        config.persistence.retry_count = 9;
        let pipeline = config.pipeline();
        assert_eq!(pipeline.policy(CallClass::Persistence).max_attempts, 9);
        assert_eq!(pipeline.policy(CallClass::Mediator).max_attempts, 3);
    }

    #[test]
    fn logging_section_maps_to_options() {
        let section = LoggingSection { format: "JSON".into(), filter: "catga_flow=debug".into() };
        let options = section.options();
        assert_eq!(options.format, LogFormat::Json);
        assert_eq!(options.filter, "catga_flow=debug");

        let text = LoggingSection::default().options();
        assert_eq!(text.format, LogFormat::Text);
    }
}
