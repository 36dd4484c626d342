//! Environment variable and config file support for [`BridgeConfig`].
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `SYNCBRIDGE_DEFAULT_POOL_THREADS` | `usize` | `default_pool_threads` |
//! | `SYNCBRIDGE_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `SYNCBRIDGE_IDLE_TIMEOUT_MS` | `u64` | `idle_timeout` |
//! | `SYNCBRIDGE_DEADLOCK_DETECTION` | `bool` | `deadlock_detection` |

use std::time::Duration;

use super::{BridgeConfig, ConfigError};

/// Environment variable name for the shared pool's worker count.
pub const ENV_DEFAULT_POOL_THREADS: &str = "SYNCBRIDGE_DEFAULT_POOL_THREADS";
/// Environment variable name for the thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "SYNCBRIDGE_THREAD_NAME_PREFIX";
/// Environment variable name for the pool idle timeout in milliseconds.
pub const ENV_IDLE_TIMEOUT_MS: &str = "SYNCBRIDGE_IDLE_TIMEOUT_MS";
/// Environment variable name for the deadlock fast-fail toggle.
pub const ENV_DEADLOCK_DETECTION: &str = "SYNCBRIDGE_DEADLOCK_DETECTION";

/// Apply environment variable overrides to a [`BridgeConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut BridgeConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_DEFAULT_POOL_THREADS) {
        config.default_pool_threads = parse_usize(ENV_DEFAULT_POOL_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_IDLE_TIMEOUT_MS) {
        config.idle_timeout = Duration::from_millis(parse_u64(ENV_IDLE_TIMEOUT_MS, &val)?);
    }
    if let Some(val) = read_env(ENV_DEADLOCK_DETECTION) {
        config.deadlock_detection = parse_bool(ENV_DEADLOCK_DETECTION, &val)?;
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "milliseconds as u64",
        value: val.to_string(),
    })
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable bridge configuration.
///
/// ```toml
/// [bridge]
/// default_pool_threads = 8
/// thread_name_prefix = "myapp-bridge"
/// idle_timeout_ms = 5000
/// deadlock_detection = true
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct BridgeTomlConfig {
    /// Bridge settings.
    #[serde(default)]
    pub bridge: BridgeToml,
}

/// `[bridge]` section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct BridgeToml {
    /// Worker count of the shared pool.
    pub default_pool_threads: Option<usize>,
    /// Thread name prefix.
    pub thread_name_prefix: Option<String>,
    /// Pool idle timeout in milliseconds.
    pub idle_timeout_ms: Option<u64>,
    /// Deadlock fast-fail toggle.
    pub deadlock_detection: Option<bool>,
}

/// Apply a parsed TOML config to a [`BridgeConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut BridgeConfig, toml: &BridgeTomlConfig) {
    if let Some(v) = toml.bridge.default_pool_threads {
        config.default_pool_threads = v;
    }
    if let Some(ref v) = toml.bridge.thread_name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.bridge.idle_timeout_ms {
        config.idle_timeout = Duration::from_millis(v);
    }
    if let Some(v) = toml.bridge.deadlock_detection {
        config.deadlock_detection = v;
    }
}

/// Parse a TOML string into a [`BridgeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<BridgeTomlConfig, ConfigError> {
    Ok(toml::from_str(toml_str)?)
}

/// Read and parse a TOML file into a [`BridgeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<BridgeTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_toml_str(&content)
}
