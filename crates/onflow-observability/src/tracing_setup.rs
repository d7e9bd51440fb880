//! Tracing subscriber setup

use crate::{ObservabilityError, Result};
use onflow_core::LoggingConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Service name reported in the startup line
    pub service_name: String,
    pub service_version: String,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Enable JSON logging
    pub json_logs: bool,
    /// Enable span events (enter, exit)
    pub span_events: bool,
    /// Enable colored output (for console)
    pub colored_output: bool,
    /// Log to stderr so command output on stdout stays parseable
    pub to_stderr: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "onflow".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            span_events: false,
            colored_output: true,
            to_stderr: true,
        }
    }
}

impl TracingConfig {
    /// Bridge from the application's logging section
    pub fn from_logging(logging: &LoggingConfig) -> Self {
        Self {
            log_level: logging.level.clone(),
            json_logs: logging.json,
            colored_output: !logging.json,
            ..Default::default()
        }
    }

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

    fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.log_level).map_err(|e| {
                ObservabilityError::Configuration(format!(
                    "invalid log level '{}': {}",
                    self.log_level, e
                ))
            }),
        }
    }
}

/// Install the global subscriber
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let subscriber = tracing_subscriber::registry().with(config.filter()?);

    if config.json_logs {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        let installed = if config.to_stderr {
            subscriber
                .with(fmt_layer.with_writer(std::io::stderr))
                .try_init()
        } else {
            subscriber.with(fmt_layer).try_init()
        };
        installed.map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    } else {
        let mut layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);

        if config.span_events {
            layer = layer.with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);
        }

        if !config.colored_output {
            layer = layer.with_ansi(false);
        }

        let installed = if config.to_stderr {
            subscriber
                .with(layer.with_writer(std::io::stderr))
                .try_init()
        } else {
            subscriber.with(layer).try_init()
        };
        installed.map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    }

    tracing::debug!(
        service = %config.service_name,
        version = %config.service_version,
        "Tracing initialized"
    );

    Ok(())
}

/// Span covering one engine operation on an instance
#[macro_export]
macro_rules! workflow_span {
    ($name:expr, $instance_id:expr) => {
        tracing::info_span!($name, instance_id = %$instance_id)
    };
    ($name:expr, $instance_id:expr, $($field:tt)*) => {
        tracing::info_span!($name, instance_id = %$instance_id, $($field)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();

        assert_eq!(config.service_name, "onflow");
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
        assert!(config.to_stderr);
    }

    #[test]
    fn test_from_logging() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        let config = TracingConfig::from_logging(&logging);

        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
        assert!(!config.colored_output);
    }

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::default()
            .with_service_name("onflow-worker")
            .with_log_level("warn")
            .with_json(true);

        assert_eq!(config.service_name, "onflow-worker");
        assert_eq!(config.log_level, "warn");
        assert!(config.json_logs);
    }

    #[test]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = TracingConfig::default().with_log_level("onflow=[");
        assert!(matches!(
            config.filter(),
            Err(ObservabilityError::Configuration(_))
        ));
    }
}
