//! Top-level error type for agent startup and shutdown
//!
//! Module-specific errors stay in their modules; this enum exists so the
//! binary and the application shell have one type to bubble.

use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] crate::mqtt::MqttError),

    #[error("Stats persistence error: {0}")]
    Stats(#[from] crate::services::StatsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
