//! Resilient MQTT client
//!
//! `MqttClient` owns at most one broker session at a time. `connect()` spawns
//! a reconnect loop that dials forever with a fixed, interruptible wait
//! between attempts; every established session replays the subscription
//! registry, announces `online`, and runs a consume loop that fans inbound
//! messages out to the handler table. `disconnect()` announces `offline`
//! (when connected) and tears everything down.

use rumqttc::QoS;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttSection;
use crate::mqtt::dispatcher::{dispatch_message, HandlerError, HandlerTable, MessageHandler, Payload};
use crate::mqtt::policy::{recovery_for, Fault, Recovery};
use crate::mqtt::session::{
    InboundMessage, MqttError, RumqttcSessionFactory, Session, SessionFactory, SessionOptions,
};
use crate::mqtt::subscriptions::{Subscription, SubscriptionRegistry};
use crate::mqtt::topics::{TopicNamespace, MESSAGE_LEAF, STATUS_LEAF};

/// Connection lifecycle as observable through the state channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How long `disconnect()` waits for the reconnect loop before aborting it.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Async hook run after every successful session establishment.
pub type PostConnectHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>> + Send + Sync>;

/// Resilient publish/subscribe client for one device.
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: SessionOptions,
    namespace: TopicNamespace,
    reconnect_interval: Duration,
    factory: Arc<dyn SessionFactory>,
    registry: SubscriptionRegistry,
    handlers: HandlerTable,
    session: Mutex<Option<Box<dyn Session>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    post_connect_hook: std::sync::Mutex<Option<PostConnectHook>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl MqttClient {
    /// Create a client that dials the configured broker over rumqttc.
    pub fn new(config: &MqttSection) -> Result<Self, MqttError> {
        Self::with_factory(config, Arc::new(RumqttcSessionFactory))
    }

    /// Create a client over a custom session factory.
    pub fn with_factory(
        config: &MqttSection,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, MqttError> {
        let namespace = TopicNamespace::new(&config.resolved_base_topic());
        let options = SessionOptions::from_config(config, &namespace)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                namespace,
                reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
                factory,
                registry: SubscriptionRegistry::new(),
                handlers: HandlerTable::new(),
                session: Mutex::new(None),
                listener: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                post_connect_hook: std::sync::Mutex::new(None),
                state_tx,
                shutdown_tx,
            }),
        })
    }

    /// The device's topic namespace.
    pub fn topics(&self) -> &TopicNamespace {
        &self.inner.namespace
    }

    /// The MQTT client identifier (the configured device id).
    pub fn device_id(&self) -> &str {
        &self.inner.options.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the client reaches `Connected`.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.state_changes();
        let _ = rx.wait_for(|state| *state == ConnectionState::Connected).await;
    }

    /// Start the reconnect loop. A no-op (with a warning) when the loop is
    /// already running; otherwise the shutdown signal is cleared first so a
    /// previously disconnected client can come back.
    pub async fn connect(&self) {
        let mut task_slot = self.inner.reconnect_task.lock().await;
        if let Some(handle) = task_slot.as_ref() {
            if !handle.is_finished() {
                warn!("Connect called but reconnect loop already running");
                return;
            }
        }

        self.inner.shutdown_tx.send_replace(false);
        info!(
            "Starting reconnect loop for device {}",
            self.inner.options.client_id
        );
        *task_slot = Some(tokio::spawn(reconnect_loop(Arc::clone(&self.inner))));
    }

    /// Clean shutdown: stop the reconnect loop, announce `offline` when the
    /// session is still up, then tear the session down. Idempotent, and safe
    /// on a client that never connected.
    pub async fn disconnect(&self) {
        info!("Initiating clean disconnect");
        self.inner.shutdown_tx.send_replace(true);

        if let Some(mut handle) = self.inner.reconnect_task.lock().await.take() {
            if tokio::time::timeout(LOOP_STOP_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Reconnect loop did not stop in time; aborting it");
                handle.abort();
            }
        }

        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.inner.send_status("offline").await {
                warn!("Offline status not published: {e}");
            }
        }

        cleanup_connection(&self.inner).await;
        info!("MQTT client disconnected");
    }

    /// Record subscriptions and, when connected, subscribe live (best
    /// effort). New entries are replayed on every future reconnect.
    pub async fn add_subscriptions(&self, pairs: &[(String, QoS)]) -> Result<(), MqttError> {
        let added = self.inner.registry.add(pairs);
        if added.is_empty() {
            return Ok(());
        }
        if !self.is_connected() {
            debug!(
                "Recorded {} subscription(s) for replay at connect",
                added.len()
            );
            return Ok(());
        }

        let session = self.inner.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Ok(());
        };
        for entry in &added {
            info!("Subscribing to {} (qos {:?})", entry.topic, entry.qos);
            if let Err(e) = session.subscribe(&entry.topic, entry.qos).await {
                if recovery_for(Fault::LiveSubscribe).propagates() {
                    return Err(e);
                }
                warn!(
                    "Live subscribe to {} failed; entry kept for replay: {e}",
                    entry.topic
                );
            }
        }
        Ok(())
    }

    /// Drop registry entries for the topics and, when connected, unsubscribe
    /// live (best effort).
    pub async fn remove_subscriptions(&self, topics: &[String]) -> Result<(), MqttError> {
        let removed = self.inner.registry.remove(topics);
        if removed.is_empty() {
            return Ok(());
        }
        if !self.is_connected() {
            return Ok(());
        }

        let mut seen: Vec<&str> = Vec::new();
        let session = self.inner.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Ok(());
        };
        for entry in &removed {
            if seen.contains(&entry.topic.as_str()) {
                continue;
            }
            seen.push(&entry.topic);
            info!("Unsubscribing from {}", entry.topic);
            if let Err(e) = session.unsubscribe(&entry.topic).await {
                if recovery_for(Fault::LiveUnsubscribe).propagates() {
                    return Err(e);
                }
                warn!("Live unsubscribe from {} failed: {e}", entry.topic);
            }
        }
        Ok(())
    }

    /// Current registry entries in replay order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.registry.snapshot()
    }

    /// Bind a handler to a topic (idempotent per handler name).
    pub fn bind_handler(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.bind(topic, handler);
    }

    /// Bind several topics at once.
    pub fn bind_handlers(
        &self,
        bindings: impl IntoIterator<Item = (String, Vec<Arc<dyn MessageHandler>>)>,
    ) {
        self.inner.handlers.bind_many(bindings);
    }

    /// Remove one named handler from a topic, or all of them.
    pub fn unbind_handler(&self, topic: &str, handler_name: Option<&str>) -> usize {
        self.inner.handlers.unbind(topic, handler_name)
    }

    /// Direct access to the handler table.
    pub fn handlers(&self) -> &HandlerTable {
        &self.inner.handlers
    }

    /// Run a hook after every successful session establishment. Hook errors
    /// are logged and never fail the connect.
    pub fn set_post_connect_hook<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let wrapped: PostConnectHook = Arc::new(move || Box::pin(hook()));
        *self
            .inner
            .post_connect_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(wrapped);
    }

    /// Serialize `payload` (JSON `null` becomes `{}`) and publish it under
    /// the base topic. Not connected: logged and dropped. A protocol-level
    /// failure marks the connection lost and is returned.
    pub async fn publish_json(
        &self,
        leaf: &str,
        payload: &Value,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.inner.publish_json(leaf, payload, qos, retain).await
    }

    /// Publish `{"state": <state>}` on the status leaf, qos 1, retained.
    pub async fn send_status(&self, state: &str) -> Result<(), MqttError> {
        self.inner.send_status(state).await
    }

    /// Publish an operator-visible notice on the message leaf, qos 2. With
    /// `error` set the payload carries `"is_error": true`.
    pub async fn send_message(
        &self,
        text: &str,
        extra: Option<&Payload>,
        error: bool,
    ) -> Result<(), MqttError> {
        self.inner.send_message(text, extra, error).await
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // No async in Drop; callers wanting the offline announcement must
        // disconnect() explicitly. This only stops the background tasks.
        self.inner.shutdown_tx.send_replace(true);
        if let Ok(mut slot) = self.inner.reconnect_task.try_lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.inner.listener.try_lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl ClientInner {
    async fn publish_json(
        &self,
        leaf: &str,
        payload: &Value,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        let topic = self.namespace.topic(leaf);

        if *self.state_tx.borrow() != ConnectionState::Connected {
            if recovery_for(Fault::PublishUnconnected).propagates() {
                return Err(MqttError::PublishFailed {
                    topic,
                    source: "client not connected".to_string().into(),
                });
            }
            error!("Cannot publish to {topic}: client not connected; dropping message");
            return Ok(());
        }

        let body = if payload.is_null() {
            b"{}".to_vec()
        } else {
            serde_json::to_vec(payload).map_err(MqttError::SerializationError)?
        };

        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            error!("Cannot publish to {topic}: no live session; dropping message");
            return Ok(());
        };

        match session.publish(&topic, body, qos, retain).await {
            Ok(()) => {
                debug!("Published to {topic} (qos {qos:?}, retain {retain})");
                Ok(())
            }
            Err(e) => {
                if recovery_for(Fault::PublishProtocol).propagates() {
                    error!("Publish to {topic} failed; marking connection lost: {e}");
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    Err(e)
                } else {
                    warn!("Publish to {topic} failed: {e}");
                    Ok(())
                }
            }
        }
    }

    async fn send_status(&self, state: &str) -> Result<(), MqttError> {
        let payload = serde_json::json!({ "state": state });
        self.publish_json(STATUS_LEAF, &payload, QoS::AtLeastOnce, true)
            .await
    }

    async fn send_message(
        &self,
        text: &str,
        extra: Option<&Payload>,
        error: bool,
    ) -> Result<(), MqttError> {
        let mut body = Payload::new();
        body.insert("message".to_string(), Value::String(text.to_string()));
        if let Some(extra) = extra {
            for (key, value) in extra {
                body.insert(key.clone(), value.clone());
            }
        }
        if error {
            body.insert("is_error".to_string(), Value::Bool(true));
        }
        self.publish_json(MESSAGE_LEAF, &Value::Object(body), QoS::ExactlyOnce, false)
            .await
    }

    fn post_connect_hook(&self) -> Option<PostConnectHook> {
        self.post_connect_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Dial forever. Each pass establishes a session, then parks until shutdown
/// or the session's consume loop ends; on loss the dead session is cleaned
/// up and the next attempt waits the fixed interval, interruptibly.
async fn reconnect_loop(inner: Arc<ClientInner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match connect_once(&inner).await {
            Ok(mut listener_done) => {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => {
                        // Leave the session up so disconnect() can announce
                        // offline before tearing it down.
                        if recovery_for(Fault::Shutdown) == Recovery::SilentUnwind {
                            debug!("Reconnect loop observed shutdown");
                        }
                        return;
                    }
                    _ = &mut listener_done => {
                        info!("Session ended; scheduling reconnect");
                    }
                }
            }
            Err(e) => {
                if recovery_for(Fault::ConnectAttempt) == Recovery::RetryAfterInterval {
                    warn!(
                        "Connection attempt failed: {e}; retrying in {:?}",
                        inner.reconnect_interval
                    );
                }
            }
        }

        cleanup_connection(&inner).await;

        if *shutdown_rx.borrow() {
            break;
        }
        if !interruptible_sleep(&mut shutdown_rx, inner.reconnect_interval).await {
            break;
        }
    }
    debug!("Reconnect loop stopped");
}

/// Establish one session: open, mark connected, replay the registry in
/// insertion order, announce online, run the post-connect hook, start the
/// consume loop. Any error unwinds to the reconnect loop.
async fn connect_once(inner: &Arc<ClientInner>) -> Result<oneshot::Receiver<()>, MqttError> {
    inner.state_tx.send_replace(ConnectionState::Connecting);
    info!(
        "Connecting to {}:{} as {}",
        inner.options.host, inner.options.port, inner.options.client_id
    );

    let (session, stream) = match inner.factory.open(&inner.options).await {
        Ok(opened) => opened,
        Err(e) => {
            inner.state_tx.send_replace(ConnectionState::Disconnected);
            return Err(e);
        }
    };

    *inner.session.lock().await = Some(session);
    inner.state_tx.send_replace(ConnectionState::Connected);
    info!("Connected to {}:{}", inner.options.host, inner.options.port);

    replay_subscriptions(inner).await?;
    inner.send_status("online").await?;

    if let Some(hook) = inner.post_connect_hook() {
        if let Err(e) = hook().await {
            warn!("Post-connect hook failed: {e}");
        }
    }

    let (done_tx, done_rx) = oneshot::channel();
    let listener = tokio::spawn(consume_loop(Arc::clone(inner), stream, done_tx));
    *inner.listener.lock().await = Some(listener);

    Ok(done_rx)
}

async fn replay_subscriptions(inner: &ClientInner) -> Result<(), MqttError> {
    let entries = inner.registry.snapshot();
    if entries.is_empty() {
        return Ok(());
    }

    let session = inner.session.lock().await;
    let Some(session) = session.as_ref() else {
        return Ok(());
    };
    for entry in &entries {
        info!("Subscribing to {} (qos {:?})", entry.topic, entry.qos);
        if let Err(e) = session.subscribe(&entry.topic, entry.qos).await {
            if recovery_for(Fault::ReplaySubscribe).propagates() {
                return Err(e);
            }
            warn!("Replay subscribe to {} failed: {e}", entry.topic);
        }
    }
    Ok(())
}

/// Consume the session's inbound stream until it ends or shutdown is
/// observed. Handler failures are reported on the message channel per the
/// fault policy. Dropping `_done` wakes the reconnect loop.
async fn consume_loop(
    inner: Arc<ClientInner>,
    mut stream: mpsc::Receiver<InboundMessage>,
    _done: oneshot::Sender<()>,
) {
    let shutdown_rx = inner.shutdown_tx.subscribe();
    while let Some(message) = stream.recv().await {
        if *shutdown_rx.borrow() {
            debug!("Consume loop observed shutdown");
            break;
        }

        let failures = dispatch_message(&inner.handlers, &message.topic, &message.payload).await;
        for failure in failures {
            if recovery_for(Fault::HandlerExecution).reports() {
                let report = failure.error.to_string();
                if let Err(e) = inner.send_message(&report, None, true).await {
                    debug!(
                        "Error report for handler '{}' not published: {e}",
                        failure.handler
                    );
                }
            }
        }
    }
    debug!("Inbound message stream ended");
}

/// Tear down the current session: state to Disconnected, stop the consume
/// loop, close the session.
async fn cleanup_connection(inner: &Arc<ClientInner>) {
    inner.state_tx.send_replace(ConnectionState::Disconnected);

    if let Some(listener) = inner.listener.lock().await.take() {
        listener.abort();
        let _ = listener.await;
    }

    if let Some(session) = inner.session.lock().await.take() {
        if let Err(e) = session.close().await {
            debug!("Session close reported: {e}");
        }
    }
}

/// Returns false when the wait was cut short by shutdown.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.wait_for(|stop| *stop) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
