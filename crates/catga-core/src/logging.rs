//! Tracing bootstrap.
//!
//! This module does not read the environment itself: the configuration
//! layer resolves file + env into [`LogOptions`] and hands them down,
//! so there is exactly one place deciding how the process logs.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines for development.
    #[default]
    Text,
    /// One flattened JSON object per event, for log aggregation.
    Json,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub format: LogFormat,
    /// Filter directive, e.g. `info` or `catga_outbox=debug,info`.
    pub filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { format: LogFormat::Text, filter: "info".to_string() }
    }
}

impl LogOptions {
    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Install the global subscriber. Safe to call more than once: a
/// subscriber that is already installed (tests, embedding hosts) wins
/// and the call becomes a no-op.
pub fn init_logging(options: &LogOptions) {
    let filter =
        EnvFilter::try_new(&options.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match options.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().flatten_event(true).with_target(true))
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(true))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("global subscriber already installed, keeping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_text_at_info() {
        let options = LogOptions::default();
        assert_eq!(options.format, LogFormat::Text);
        assert_eq!(options.filter, "info");
    }

    #[test]
    fn builder_flips_format_and_filter() {
        let options = LogOptions::default().json().with_filter("catga_flow=trace");
        assert_eq!(options.format, LogFormat::Json);
        assert_eq!(options.filter, "catga_flow=trace");
    }

    #[test]
    fn init_is_idempotent() {
        let options = LogOptions::default();
        init_logging(&options);
        // A second call must not panic even though a subscriber is set.
        init_logging(&options.clone().json());
    }

    #[test]
    fn bad_filter_directive_falls_back() {
        // Would be rejected by EnvFilter; init must still succeed.
        let options = LogOptions::default().with_filter("===");
        init_logging(&options);
    }
}
