//! Configuration management for admission control.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, Result};
use crate::ratelimit::{FailMode, FixedWindowConfig, SlidingWindowConfig, DEFAULT_KEY_PREFIX};

/// Prefix for environment overrides, e.g.
/// `RATE_ADMISSION__SLIDING_WINDOW__MAX_REQUESTS=20`.
const ENV_PREFIX: &str = "RATE_ADMISSION";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Sliding window limiter configuration
    #[serde(default)]
    pub sliding_window: SlidingWindowConfig,

    /// Fixed window counter configuration
    #[serde(default)]
    pub fixed_window: FixedWindowConfig,

    /// Remote counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Requests allowed per bucket
    #[serde(default = "default_budget")]
    pub budget: i64,

    /// Bucket expiry in milliseconds
    #[serde(default = "default_expiry_ms")]
    pub expiry_ms: u64,

    /// Per round trip timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// What to decide when the store cannot answer
    #[serde(default)]
    pub fail_mode: FailMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            budget: default_budget(),
            expiry_ms: default_expiry_ms(),
            timeout_ms: default_timeout_ms(),
            fail_mode: FailMode::default(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_budget() -> i64 {
    5
}

fn default_expiry_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    500
}

impl StoreConfig {
    /// Bucket expiry.
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    /// Per round trip timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
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

impl AdmissionConfig {
    /// Load configuration from a YAML file, with environment overrides on top.
    ///
    /// A file that cannot be read is an [`AdmissionError::Io`]; bad contents
    /// are an [`AdmissionError::Config`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;

        let config: AdmissionConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(
                &contents,
                ::config::FileFormat::Yaml,
            ))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AdmissionError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AdmissionConfig = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for values the limiters cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.sliding_window.validate()?;

        if self.fixed_window.window_ms == 0 {
            return Err(AdmissionError::Config(
                "fixed_window.window_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(AdmissionError::Config(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.expiry_ms == 0 {
            return Err(AdmissionError::Config(
                "store.expiry_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
