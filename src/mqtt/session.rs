//! Broker session boundary
//!
//! The protocol library sits behind the `Session`/`SessionFactory` traits.
//! `open()` dials the broker, drives the event loop until CONNACK and returns
//! the live session plus the inbound message stream. An internal pump task
//! keeps polling the event loop; when the connection dies the stream ends,
//! which is how the reconnect loop learns about the loss.

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::MqttSection;
use crate::mqtt::topics::TopicNamespace;

/// Queued-request capacity handed to the protocol client.
const CLIENT_REQUEST_CAP: usize = 10;

/// Inbound message buffer between the event pump and the dispatcher.
const INBOUND_BUFFER: usize = 100;

/// How long a closing session waits for its event pump to stop.
const PUMP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection not acknowledged within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing to '{topic}' failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Subscribing to '{topic}' failed")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Unsubscribing from '{topic}' failed")]
    UnsubscribeFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

/// One message received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Will message registered with the broker at connect time.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything needed to dial the broker, resolved once from configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub last_will: Option<WillMessage>,
}

impl SessionOptions {
    /// Build session options from the `[mqtt]` config section.
    ///
    /// The broker URL supplies host, port (default 1883, or 8883 for `mqtts`)
    /// and whether TLS is enabled. Credentials are read from the configured
    /// environment variables. The will announces `offline` on the status
    /// topic, retained at QoS 2, so ungraceful death still flips the state.
    pub fn from_config(
        config: &MqttSection,
        namespace: &TopicNamespace,
    ) -> Result<Self, MqttError> {
        let url = Url::parse(&config.broker_url)
            .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?
            .to_string();
        let tls = url.scheme() == "mqtts";
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        let lwt_payload = serde_json::to_vec(&serde_json::json!({ "state": "offline" }))
            .map_err(MqttError::SerializationError)?;
        let last_will = WillMessage {
            topic: namespace.status(),
            payload: lwt_payload,
            qos: QoS::ExactlyOnce,
            retain: true,
        };

        Ok(Self {
            host,
            port,
            client_id: config.device_id.clone(),
            username: config.username(),
            password: config.password(),
            tls,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            last_will: Some(last_will),
        })
    }
}

/// A live broker session from CONNACK until loss or close.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;
    /// Close the session. The inbound stream ends shortly after.
    async fn close(&self) -> Result<(), MqttError>;
}

/// Opens broker sessions. The production factory dials over rumqttc; tests
/// substitute a scripted one.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        options: &SessionOptions,
    ) -> Result<(Box<dyn Session>, mpsc::Receiver<InboundMessage>), MqttError>;
}

/// Production session factory backed by rumqttc.
#[derive(Debug, Default)]
pub struct RumqttcSessionFactory;

#[async_trait::async_trait]
impl SessionFactory for RumqttcSessionFactory {
    async fn open(
        &self,
        options: &SessionOptions,
    ) -> Result<(Box<dyn Session>, mpsc::Receiver<InboundMessage>), MqttError> {
        let mqtt_options = build_mqtt_options(options);
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, CLIENT_REQUEST_CAP);

        let connack = tokio::time::timeout(options.connect_timeout, await_connack(&mut event_loop))
            .await
            .map_err(|_| MqttError::ConnectTimeout(options.connect_timeout))??;
        debug!(
            session_present = connack.session_present,
            "Broker acknowledged connection"
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_events(event_loop, inbound_tx, Arc::clone(&closed)));

        let session = RumqttcSession {
            client,
            closed,
            pump: tokio::sync::Mutex::new(Some(pump)),
        };
        Ok((Box::new(session), inbound_rx))
    }
}

fn build_mqtt_options(options: &SessionOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);

    if options.tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(options.keep_alive);

    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            will.qos,
            will.retain,
        ));
    }

    mqtt_options
}

/// Drive the event loop until the broker acknowledges the connection.
async fn await_connack(event_loop: &mut EventLoop) -> Result<ConnAck, MqttError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(ack);
                }
                return Err(MqttError::ConnectionFailed(
                    format!("broker refused connection: {:?}", ack.code).into(),
                ));
            }
            Ok(_) => continue,
            Err(e) => return Err(MqttError::ConnectionFailed(Box::new(e))),
        }
    }
}

/// Poll the event loop for the life of the session, forwarding inbound
/// publishes. Returning drops the sender, which ends the inbound stream.
async fn pump_events(
    mut event_loop: EventLoop,
    inbound_tx: mpsc::Sender<InboundMessage>,
    closed: Arc<AtomicBool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if inbound_tx.send(message).await.is_err() {
                    debug!("Inbound receiver dropped; stopping event pump");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent to broker; stopping event pump");
                break;
            }
            Ok(event) => {
                trace!(?event, "MQTT event");
            }
            Err(e) => {
                if closed.load(Ordering::SeqCst) {
                    debug!("Event pump stopped after close: {e}");
                } else {
                    warn!("MQTT connection lost: {e}");
                }
                break;
            }
        }
    }
}

struct RumqttcSession {
    client: AsyncClient,
    closed: Arc<AtomicBool>,
    pump: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Session for RumqttcSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| MqttError::SubscribeFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::UnsubscribeFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    async fn close(&self) -> Result<(), MqttError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not delivered: {e}");
        }
        if let Some(mut handle) = self.pump.lock().await.take() {
            if tokio::time::timeout(PUMP_STOP_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Event pump did not stop in time; aborting it");
                handle.abort();
            }
        }
        Ok(())
    }
}
