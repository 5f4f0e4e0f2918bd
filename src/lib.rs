//! Tetherd - resilient MQTT agent for long-running devices
//!
//! Keeps one logical broker connection alive for the life of the process:
//! connection loss triggers unlimited retries at a fixed interval, every new
//! session replays the recorded subscriptions before announcing itself, and
//! inbound messages fan out to per-topic handlers that cannot take the
//! process down.
//!
//! # Overview
//!
//! The crate is organized as:
//! - MQTT layer with connection management, subscription replay, and dispatch
//! - Background services (heartbeat, stats persistence)
//! - TOML configuration with environment-based credentials
//! - Application shell wiring it all into a runnable agent
//!
//! # Quick Start
//!
//! ```rust
//! use tetherd::mqtt::TopicNamespace;
//!
//! // Every topic the device uses lives under one base.
//! let topics = TopicNamespace::new("device/42/");
//! assert_eq!(topics.base(), "device/42");
//! assert_eq!(topics.status(), "device/42/status");
//! assert_eq!(topics.topic("telemetry/cpu"), "device/42/telemetry/cpu");
//! ```
//!
//! Connecting for real goes through [`mqtt::MqttClient`]; see the [`mqtt`]
//! module docs for a full example.

pub mod app;
pub mod config;
pub mod error;
pub mod logging;
pub mod mqtt;
pub mod services;
pub mod testing;

// Re-export the types most callers need
pub use app::App;
pub use config::Settings;
pub use error::{AgentError, AgentResult};
pub use mqtt::MqttClient;
