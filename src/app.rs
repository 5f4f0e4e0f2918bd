//! Application shell
//!
//! Wires configuration, the MQTT client, the device's message handlers, and
//! the background services into one runnable agent. The shell owns startup
//! order and the ordered teardown; the client owns everything about the
//! broker link itself.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::signal;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::AgentResult;
use crate::mqtt::{
    ConnectionState, HandlerError, MessageHandler, MqttClient, Payload, QoS, SessionFactory,
};
use crate::services::{HeartbeatService, StatsTracker};

/// Leaf topics the application listens on.
const CONFIG_LEAF: &str = "config";
const COMMAND_LEAF: &str = "command";

/// Shared running totals, incremented by handlers and read by stat sources.
#[derive(Debug, Default)]
pub struct AppCounters {
    pub messages_handled: AtomicU64,
    pub commands_processed: AtomicU64,
    pub config_updates: AtomicU64,
}

/// Applies config updates pushed over MQTT.
///
/// Updates are merged into the in-memory applied map, last write wins. An
/// empty payload is a no-op, not an error.
struct ConfigUpdateHandler {
    counters: Arc<AppCounters>,
    applied: Arc<Mutex<Payload>>,
}

#[async_trait]
impl MessageHandler for ConfigUpdateHandler {
    fn name(&self) -> &str {
        "config-update"
    }

    async fn handle(&self, topic: &str, payload: &Payload) -> Result<(), HandlerError> {
        self.counters.messages_handled.fetch_add(1, Ordering::Relaxed);
        if payload.is_empty() {
            debug!("Config update on {topic} carried no settings");
            return Ok(());
        }

        let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
        info!("Applying {} config key(s): {}", keys.len(), keys.join(", "));

        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in payload {
            applied.insert(key.clone(), value.clone());
        }
        self.counters.config_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Executes operator commands of the form `{"action": "..."}`.
struct CommandHandler {
    counters: Arc<AppCounters>,
    stats: Arc<StatsTracker>,
}

#[async_trait]
impl MessageHandler for CommandHandler {
    fn name(&self) -> &str {
        "command"
    }

    async fn handle(&self, _topic: &str, payload: &Payload) -> Result<(), HandlerError> {
        self.counters.messages_handled.fetch_add(1, Ordering::Relaxed);

        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .ok_or("Command payload missing string field 'action'")?;

        match action {
            "ping" => info!("Command ping acknowledged"),
            "save_stats" => {
                self.stats.save().await?;
                info!("Stats snapshot saved on request");
            }
            other => return Err(format!("Unknown command action: {other}").into()),
        }

        self.counters.commands_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The assembled agent.
pub struct App {
    settings: Settings,
    client: Arc<MqttClient>,
    heartbeat: HeartbeatService,
    stats: Arc<StatsTracker>,
    counters: Arc<AppCounters>,
    applied_config: Arc<Mutex<Payload>>,
}

impl App {
    /// Assemble the agent against the real broker transport.
    pub async fn new(settings: Settings) -> AgentResult<Self> {
        let client = Arc::new(MqttClient::new(&settings.mqtt)?);
        Self::wire(settings, client).await
    }

    /// Assemble the agent over a custom session factory.
    pub async fn with_factory(
        settings: Settings,
        factory: Arc<dyn SessionFactory>,
    ) -> AgentResult<Self> {
        let client = Arc::new(MqttClient::with_factory(&settings.mqtt, factory)?);
        Self::wire(settings, client).await
    }

    async fn wire(settings: Settings, client: Arc<MqttClient>) -> AgentResult<Self> {
        let counters = Arc::new(AppCounters::default());
        let stats = Arc::new(StatsTracker::new(&settings.stats));
        let heartbeat = HeartbeatService::new(Arc::clone(&client), &settings.heartbeat);
        let applied_config = Arc::new(Mutex::new(Payload::new()));

        let config_topic = client.topics().topic(CONFIG_LEAF);
        let command_topic = client.topics().topic(COMMAND_LEAF);

        client
            .add_subscriptions(&[
                (config_topic.clone(), QoS::AtLeastOnce),
                (command_topic.clone(), QoS::AtLeastOnce),
            ])
            .await?;

        client.bind_handler(
            &config_topic,
            Arc::new(ConfigUpdateHandler {
                counters: Arc::clone(&counters),
                applied: Arc::clone(&applied_config),
            }),
        );
        client.bind_handler(
            &command_topic,
            Arc::new(CommandHandler {
                counters: Arc::clone(&counters),
                stats: Arc::clone(&stats),
            }),
        );

        let handled = Arc::clone(&counters);
        stats.register_source("messages_handled", move || {
            Some(Value::from(handled.messages_handled.load(Ordering::Relaxed)))
        });
        let commands = Arc::clone(&counters);
        stats.register_source("commands_processed", move || {
            Some(Value::from(
                commands.commands_processed.load(Ordering::Relaxed),
            ))
        });
        let configs = Arc::clone(&counters);
        stats.register_source("config_updates", move || {
            Some(Value::from(configs.config_updates.load(Ordering::Relaxed)))
        });
        let state_rx = client.state_changes();
        stats.register_source("connected", move || {
            Some(Value::Bool(*state_rx.borrow() == ConnectionState::Connected))
        });

        if settings.heartbeat.enabled {
            let trigger = heartbeat.trigger();
            client.set_post_connect_hook(move || {
                let trigger = Arc::clone(&trigger);
                async move {
                    trigger.notify_one();
                    Ok(())
                }
            });
        }

        Ok(Self {
            settings,
            client,
            heartbeat,
            stats,
            counters,
            applied_config,
        })
    }

    pub fn client(&self) -> &Arc<MqttClient> {
        &self.client
    }

    pub fn counters(&self) -> &Arc<AppCounters> {
        &self.counters
    }

    /// Config keys pushed over MQTT so far, last write wins.
    pub fn applied_config(&self) -> Payload {
        self.applied_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start services and the connection, then run until SIGINT or SIGTERM.
    pub async fn run(mut self) -> AgentResult<()> {
        self.start().await;

        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        // Wait for the first connection or a signal, whichever comes first;
        // the reconnect loop keeps dialing in the background either way.
        let mut interrupted = false;
        tokio::select! {
            _ = self.client.wait_until_connected() => info!("Initial connection established"),
            _ = sigint.recv() => interrupted = true,
            _ = sigterm.recv() => interrupted = true,
        }

        if !interrupted {
            info!("Agent is running; send SIGINT or SIGTERM to stop");
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
            }
        } else {
            info!("Received shutdown signal before first connection");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Start background services and the reconnect loop.
    pub async fn start(&mut self) {
        match self.stats.load_previous().await {
            Ok(Some(previous)) => info!("Stats from previous run: {previous}"),
            Ok(None) => {}
            Err(e) => warn!("Could not read previous stats: {e}"),
        }

        if self.settings.heartbeat.enabled {
            self.heartbeat.start();
        }
        Arc::clone(&self.stats).start();
        self.client.connect().await;
    }

    /// Ordered teardown: heartbeat first so no beat lands after the offline
    /// status, then the client, then a final stats snapshot.
    pub async fn shutdown(&mut self) {
        self.heartbeat.stop().await;
        self.client.disconnect().await;
        self.stats.stop().await;
        info!("Agent shutdown complete");
    }
}
