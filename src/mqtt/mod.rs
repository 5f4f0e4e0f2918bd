//! Resilient MQTT layer for long-running device agents
//!
//! This module keeps one logical broker connection alive for the lifetime of
//! the process: subscriptions survive reconnects, inbound messages fan out to
//! registered handlers, and publishes degrade gracefully while the link is
//! down.
//!
//! # Architecture
//!
//! The module is split into focused sub-modules:
//!
//! - [`topics`] - Topic namespace and the well-known status/message leaves
//! - [`policy`] - Consolidated fault-to-recovery table
//! - [`session`] - Session boundary over the rumqttc transport
//! - [`subscriptions`] - Replayable subscription registry
//! - [`dispatcher`] - Handler table and per-message fan-out
//! - [`client`] - Connection manager that ties the pieces together
//!
//! # Usage
//!
//! ```rust,no_run
//! use tetherd::config::MqttSection;
//! use tetherd::mqtt::{handler_fn, MqttClient, QoS};
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     device_id: "thermostat-7".to_string(),
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     base_topic: None,
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 30,
//!     reconnect_interval_secs: 5,
//!     connect_timeout_secs: 30,
//! };
//!
//! let client = MqttClient::new(&config)?;
//! client
//!     .add_subscriptions(&[("devices/thermostat-7/command".to_string(), QoS::AtLeastOnce)])
//!     .await?;
//! client.bind_handler(
//!     "devices/thermostat-7/command",
//!     handler_fn("log-command", |topic, _payload| async move {
//!         println!("command received on {topic}");
//!         Ok(())
//!     }),
//! );
//! client.connect().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod client;
pub mod dispatcher;
pub mod policy;
pub mod session;
pub mod subscriptions;
pub mod topics;

// Re-export public types for convenience
pub use client::{ConnectionState, MqttClient, PostConnectHook};
pub use dispatcher::{
    decode_payload, dispatch_message, handler_fn, HandlerError, HandlerFailure, HandlerTable,
    MessageHandler, Payload,
};
pub use policy::{recovery_for, Fault, Recovery};
pub use rumqttc::QoS;
pub use session::{
    InboundMessage, MqttError, Session, SessionFactory, SessionOptions, WillMessage,
};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use topics::{TopicNamespace, HEARTBEAT_LEAF, MESSAGE_LEAF, STATUS_LEAF};
