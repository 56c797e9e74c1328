//! Configuration resolution for NotiBridge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/notibridge/settings.json)
//! 3. Host-supplied config file (highest priority)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete NotiBridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-device session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Timeout for opening the transport (milliseconds).
    pub connect_timeout_ms: u64,
    /// Default deadline for correlated requests (milliseconds).
    pub request_timeout_ms: u64,
    /// Deadline extension granted after a `pending: true` response (milliseconds).
    pub approval_timeout_ms: u64,
    /// WebSocket ping interval (milliseconds).
    pub heartbeat_interval_ms: u64,
    /// Capacity of the session event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            approval_timeout_ms: 120_000,
            heartbeat_interval_ms: 30_000,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 3_000,
            max_delay_ms: 30_000,
            max_attempts: Some(10),
        }
    }
}

/// Logging settings consumed by [`init_from_config`](crate::tracing_init::init_from_config).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// `override_path` is an explicit settings file supplied by the host; it is
/// an error for it to be missing, unlike the global file.
pub fn load_config(override_path: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|p| p.exists());
    load_layered(global.as_deref(), override_path)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("notibridge").join("settings.json"))
}

/// Overlay `override_path` onto `global` key by key, then fill the gaps
/// with defaults. Fields absent from the override keep the global value.
fn load_layered(global: Option<&Path>, override_path: Option<&Path>) -> Result<Config> {
    let mut merged = Value::Object(serde_json::Map::new());
    for path in global.into_iter().chain(override_path) {
        merge_values(&mut merged, read_config_value(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

#[cfg(test)]
fn load_config_file(path: &Path) -> Result<Config> {
    load_layered(Some(path), None)
}

/// Objects merge recursively; any other overlay value replaces the base.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_values(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}
