//! Bridge configuration.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set on [`BridgeBuilder`](crate::BridgeBuilder)
//! 2. **Environment variables**: `SYNCBRIDGE_*` (see [`env`])
//! 3. **Config file**: a TOML file (requires the `config-file` feature)
//! 4. **Defaults**: [`BridgeConfig::default()`]

pub mod env;

use std::time::Duration;
use thiserror::Error;

use crate::error::{Error, ErrorKind};

/// Upper bound on the default worker count of the shared pool.
pub const MAX_DEFAULT_POOL_THREADS: usize = 32;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable holds a value that does not parse.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Human-readable expected type.
        expected: &'static str,
        /// The raw value found.
        value: String,
    },

    /// A field failed validation.
    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`BridgeConfig`].
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::Config)
            .with_message(err.to_string())
            .with_source(err)
    }
}

/// Resolved configuration of a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Worker count of the shared pool used by non-thread-sensitive calls.
    pub default_pool_threads: usize,
    /// Prefix for the names of every thread the bridge spawns.
    pub thread_name_prefix: String,
    /// How long an idle pool worker waits for work before retiring.
    pub idle_timeout: Duration,
    /// Fail fast with `Deadlock` when a thread-sensitive call would wait on
    /// its own single-thread slot.
    pub deadlock_detection: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            default_pool_threads: (parallelism + 4).min(MAX_DEFAULT_POOL_THREADS),
            thread_name_prefix: "syncbridge".to_string(),
            idle_timeout: Duration::from_secs(10),
            deadlock_detection: true,
        }
    }
}

impl BridgeConfig {
    /// Returns the defaults with `SYNCBRIDGE_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        env::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file, then applies environment overrides on top.
    #[cfg(feature = "config-file")]
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let toml = env::parse_toml_file(path)?;
        env::apply_toml_config(&mut config, &toml);
        env::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_pool_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "default_pool_threads",
                reason: "must be at least 1",
            });
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "thread_name_prefix",
                reason: "must not be empty",
            });
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "idle_timeout",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }

    /// Formats a thread name under the configured prefix.
    #[must_use]
    pub fn thread_name(&self, role: &str) -> String {
        format!("{}-{role}", self.thread_name_prefix)
    }
}
