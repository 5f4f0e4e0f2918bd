//! Configuration for the device agent
//!
//! Settings load from a TOML file with `[mqtt]`, `[heartbeat]` and `[stats]`
//! sections. Broker credentials are never written in the file; the config
//! names environment variables and the values are read at session-open time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level settings, one struct per TOML section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub stats: StatsSection,
}

/// MQTT section: broker endpoint, identity and reconnect knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+); also the MQTT client id.
    pub device_id: String,
    /// Broker URL, scheme `mqtt` or `mqtts` (the latter enables TLS).
    pub broker_url: String,
    /// Namespace prefix for every topic; defaults to `devices/<device_id>`.
    pub base_topic: Option<String>,
    /// Environment variable containing the username.
    pub username_env: Option<String>,
    /// Environment variable containing the password.
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (minimum 5).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Fixed wait between reconnect attempts, in seconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Upper bound on waiting for the broker's CONNACK, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

impl MqttSection {
    /// The effective base topic, falling back to `devices/<device_id>`.
    pub fn resolved_base_topic(&self) -> String {
        match &self.base_topic {
            Some(base) => base.clone(),
            None => format!("devices/{}", self.device_id),
        }
    }

    /// Username read from the configured environment variable, if any.
    pub fn username(&self) -> Option<String> {
        read_env_optional(self.username_env.as_ref())
    }

    /// Password read from the configured environment variable, if any.
    pub fn password(&self) -> Option<String> {
        read_env_optional(self.password_env.as_ref())
    }
}

/// Heartbeat section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,
    /// Seconds between beats.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_enabled() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    10
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: default_heartbeat_enabled(),
            interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Stats persistence section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSection {
    /// File the stats snapshot is persisted to.
    #[serde(default = "default_stats_file")]
    pub file: PathBuf,
    /// Seconds between periodic saves.
    #[serde(default = "default_stats_save_interval")]
    pub save_interval_secs: u64,
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("tetherd-stats.json")
}

fn default_stats_save_interval() -> u64 {
    10
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            file: default_stats_file(),
            save_interval_secs: default_stats_save_interval(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.mqtt.device_id)?;

        let base = self.mqtt.resolved_base_topic();
        if base.trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidConfig(
                "base_topic must contain at least one non-slash segment".to_string(),
            ));
        }

        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.mqtt.reconnect_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect_interval_secs must be nonzero".to_string(),
            ));
        }
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be nonzero".to_string(),
            ));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "heartbeat interval_secs must be nonzero".to_string(),
            ));
        }
        if self.stats.save_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "stats save_interval_secs must be nonzero".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
device_id = "test-device"
broker_url = "mqtt://localhost:1883"
base_topic = "device/42"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn read_env_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Validate the device ID character set.
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
