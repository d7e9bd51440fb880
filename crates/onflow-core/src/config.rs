use crate::error::{CoreError, CoreResult};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("ONFLOW")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("ONFLOW").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("engine.default_max_retries", i64::from(default_max_retries()))?
            .set_default("engine.allow_concurrent_instances", false)?
            .set_default("engine.require_explicit_start", false)?
            .set_default("engine.system_actor", default_system_actor())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)
    }

    /// Validate every section
    pub fn validate(&self) -> CoreResult<()> {
        self.engine.validate()
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry budget for integrations without a per-type override
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Per integration-type retry budgets (e.g. `background_check = 5`)
    #[serde(default)]
    pub integration_max_retries: HashMap<String, u32>,
    /// Permit several non-completed instances of one workflow type per employee
    #[serde(default)]
    pub allow_concurrent_instances: bool,
    /// Require `start` before `complete`
    #[serde(default)]
    pub require_explicit_start: bool,
    /// Name recorded for automatic transitions
    #[serde(default = "default_system_actor")]
    pub system_actor: String,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            integration_max_retries: HashMap::new(),
            allow_concurrent_instances: false,
            require_explicit_start: false,
            system_actor: default_system_actor(),
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_integration_max_retries(
        mut self,
        integration_type: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        self.integration_max_retries
            .insert(integration_type.into(), max_retries);
        self
    }

    pub fn with_concurrent_instances(mut self, allow: bool) -> Self {
        self.allow_concurrent_instances = allow;
        self
    }

    pub fn with_explicit_start(mut self, required: bool) -> Self {
        self.require_explicit_start = required;
        self
    }

    /// Retry budget for an integration type
    pub fn max_retries_for(&self, integration_type: &str) -> u32 {
        self.integration_max_retries
            .get(integration_type)
            .copied()
            .unwrap_or(self.default_max_retries)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.default_max_retries == 0 {
            return Err(CoreError::InvalidConfig(
                "engine.default_max_retries must be at least 1".to_string(),
            ));
        }

        if let Some((kind, _)) = self
            .integration_max_retries
            .iter()
            .find(|(_, max)| **max == 0)
        {
            return Err(CoreError::InvalidConfig(format!(
                "engine.integration_max_retries.{} must be at least 1",
                kind
            )));
        }

        if self.system_actor.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "engine.system_actor must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_system_actor() -> String {
    "onflow-engine".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
