//! Configuration loader with file and environment variable support.

use crate::{CatgaConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "catga.toml",
    "config.toml",
    "./config/catga.toml",
    "/etc/catga/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { config_path: Some(path.into()) }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides applied on top.
    pub fn load(&self) -> Result<CatgaConfig, ConfigError> {
        let mut config = CatgaConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = CatgaConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("CATGA_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut CatgaConfig) {
        // Logging
        if let Ok(val) = env::var("CATGA_LOG_FORMAT") {
            config.logging.format = val;
        }
        if let Ok(val) = env::var("CATGA_LOG_FILTER") {
            config.logging.filter = val;
        }

        // Mediator toggles
        if let Ok(val) = env::var("CATGA_ENABLE_LOGGING") {
            config.mediator.enable_logging = parse_bool(&val);
        }
        if let Ok(val) = env::var("CATGA_ENABLE_TRACING") {
            config.mediator.enable_tracing = parse_bool(&val);
        }
        if let Ok(val) = env::var("CATGA_ENABLE_VALIDATION") {
            config.mediator.enable_validation = parse_bool(&val);
        }
        if let Ok(val) = env::var("CATGA_ENABLE_RETRY") {
            config.mediator.enable_retry = parse_bool(&val);
        }
        if let Ok(val) = env::var("CATGA_ENABLE_IDEMPOTENCY") {
            config.mediator.enable_idempotency = parse_bool(&val);
        }
        if let Ok(val) = env::var("CATGA_ENABLE_DLQ") {
            config.mediator.enable_dead_letter_queue = parse_bool(&val);
        }
        if let Ok(val) = env::var("CATGA_MAX_RETRY_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.mediator.max_retry_attempts = n;
            }
        }
        if let Ok(val) = env::var("CATGA_TIMEOUT_SECONDS") {
            if let Ok(n) = val.parse() {
                config.mediator.timeout_seconds = n;
            }
        }

        // Stores and loops
        if let Ok(val) = env::var("CATGA_IDEMPOTENCY_SHARDS") {
            if let Ok(n) = val.parse() {
                config.idempotency.shard_count = n;
            }
        }
        if let Ok(val) = env::var("CATGA_IDEMPOTENCY_TTL_SECONDS") {
            if let Ok(n) = val.parse() {
                config.idempotency.ttl_seconds = n;
            }
        }
        if let Ok(val) = env::var("CATGA_INBOX_LOCK_TTL_SECONDS") {
            if let Ok(n) = val.parse() {
                config.inbox.lock_ttl_seconds = n;
            }
        }
        if let Ok(val) = env::var("CATGA_OUTBOX_POLL_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                config.outbox.poll_interval_ms = n;
            }
        }
        if let Ok(val) = env::var("CATGA_SCHEDULER_POLL_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                config.scheduler.poll_interval_ms = n;
            }
        }
        if let Ok(val) = env::var("CATGA_FLOW_HEARTBEAT_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                config.flow.heartbeat_interval_ms = n;
            }
        }
        if let Ok(val) = env::var("CATGA_FLOW_STALE_THRESHOLD_MS") {
            if let Ok(n) = val.parse() {
                config.flow.stale_threshold_ms = n;
            }
        }
        if let Ok(val) = env::var("CATGA_COMPRESSION_ALGORITHM") {
            config.compression.algorithm = val;
        }
        if let Ok(val) = env::var("CATGA_COMPRESSION_MIN_SIZE") {
            if let Ok(n) = val.parse() {
                config.compression.min_size_bytes = n;
            }
        }
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_defaults_without_file() {
        let loader = ConfigLoader::with_path("/nonexistent/catga.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.outbox.batch_size, 100);
    }

    #[test]
    fn loads_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[inbox]\nlock_ttl_seconds = 99").unwrap();

        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.inbox.lock_ttl_seconds, 99);
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }
}
