//! Server configuration and loading.
//!
//! Loading flow:
//! 1. Start with compiled [`AppConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its values over defaults
//! 3. Apply `FLOWRELAY_*` environment variable overrides
//!
//! Command-line flags are applied by the binary on top of the result.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use flowrelay_telemetry::TelemetryConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Configuration for the flowrelay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind. `0` auto-assigns.
    pub port: u16,
    /// Origins allowed by CORS. `["*"]` allows any origin without credentials.
    pub allowed_origins: Vec<String>,
    /// Per-connection outbound queue length. A connection whose queue fills
    /// up is evicted.
    pub max_send_queue: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Whether a `flowUpdate` is relayed back to its sender too.
    pub echo_to_sender: bool,
    /// Answer unknown flow ids with 404 instead of 200.
    pub strict_not_found: bool,
    /// How long shutdown waits for in-flight work.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            allowed_origins: vec!["http://localhost".into(), "ws://localhost".into()],
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            echo_to_sender: true,
            strict_not_found: false,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue("max_send_queue must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(format!(
                "heartbeat_timeout_secs ({}) is shorter than heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        Ok(())
    }
}

/// Everything the binary needs to start.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
}

/// Load configuration from an optional JSON file with env var overrides.
///
/// A missing file yields defaults. A file with invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let defaults = serde_json::to_value(AppConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: AppConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.server.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `FLOWRELAY_*` overrides. Invalid values are ignored.
pub fn apply_env_overrides(config: &mut AppConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read_string(&env, "FLOWRELAY_HOST") {
        config.server.host = v;
    }
    if let Some(v) = read_string(&env, "FLOWRELAY_PORT").and_then(|v| parse_port(&v)) {
        config.server.port = v;
    }
    if let Some(v) = read_string(&env, "FLOWRELAY_ALLOWED_ORIGINS") {
        let origins: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();
        if !origins.is_empty() {
            config.server.allowed_origins = origins;
        }
    }
    if let Some(v) = read_string(&env, "FLOWRELAY_ECHO_TO_SENDER").and_then(|v| parse_bool(&v)) {
        config.server.echo_to_sender = v;
    }
    if let Some(v) = read_string(&env, "FLOWRELAY_STRICT_NOT_FOUND").and_then(|v| parse_bool(&v))
    {
        config.server.strict_not_found = v;
    }
    if let Some(v) = read_string(&env, "FLOWRELAY_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = read_string(&env, "FLOWRELAY_LOG_JSON").and_then(|v| parse_bool(&v)) {
        config.telemetry.json = v;
    }
}

fn read_string(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    env(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

fn parse_port(value: &str) -> Option<u16> {
    value.parse::<u16>().ok().filter(|p| *p >= 1)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
