//! Tracing setup
//!
//! Installs a `tracing-subscriber` registry with an env filter and either a
//! human-readable or a JSON formatting layer.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{CoreError, LoggingConfig, Result};

/// Tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Service name reported in the startup event
    pub service_name: String,
    /// Default log level when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
    /// Log span enter/exit events
    pub span_events: bool,
    /// ANSI colors for console output
    pub colored_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "corpus-builder".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            span_events: false,
            colored_output: true,
        }
    }
}

impl TracingConfig {
    pub fn with_service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_string();
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }
}

impl From<&LoggingConfig> for TracingConfig {
    fn from(logging: &LoggingConfig) -> Self {
        Self {
            log_level: logging.level.clone(),
            json_logs: logging.json,
            colored_output: !logging.json,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| CoreError::TracingInit(e.to_string()))?;
    } else {
        let mut layer = fmt::layer().with_target(true);

        if config.span_events {
            layer = layer.with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);
        }

        if !config.colored_output {
            layer = layer.with_ansi(false);
        }

        subscriber
            .with(layer)
            .try_init()
            .map_err(|e| CoreError::TracingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.log_level,
        "Tracing initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_logging_config() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        let config = TracingConfig::from(&logging);

        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
        assert!(!config.colored_output);
    }

    #[test]
    fn test_second_init_fails() {
        let config = TracingConfig::default().with_log_level("warn");
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
