//! Configuration management for Slidegate.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SlidegateError};
use crate::ratelimit::{FailureMode, DEFAULT_KEY_PREFIX};

/// Prefix of environment variables overriding file settings,
/// e.g. `SLIDEGATE__STORE__URL`.
pub const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace prefix for partition keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Limiter behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// What to do when the store fails
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Deadline for a whole acquisition or statistics attempt, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Use the single-transaction limiter instead of the soft one
    #[serde(default)]
    pub atomic: bool,

    /// Path to a limit rules file
    pub rules_path: Option<String>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            operation_timeout_ms: default_operation_timeout_ms(),
            atomic: false,
            rules_path: None,
        }
    }
}

impl LimiterSettings {
    /// The operation deadline as a duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_operation_timeout_ms() -> u64 {
    250
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
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

impl SlidegateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SlidegateConfig =
            serde_yaml::from_str(&contents).map_err(|e| SlidegateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with
    /// `SLIDEGATE__<SECTION>__<FIELD>` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: SlidegateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SlidegateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.operation_timeout_ms == 0 {
            return Err(SlidegateError::Config(
                "limiter.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.url.is_empty() {
            return Err(SlidegateError::Config("store.url must not be empty".to_string()));
        }
        Ok(())
    }
}
