//! Mock session layer for testing
//!
//! `MockBroker` records everything a client does to it (connect attempts,
//! subscriptions, publishes) and can script failures, inject inbound messages
//! into the live session's stream, and kill the session to simulate
//! connection loss. No network involved.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::mqtt::session::{InboundMessage, MqttError, Session, SessionFactory, SessionOptions};

/// Buffer for injected inbound messages.
const MOCK_INBOUND_BUFFER: usize = 32;

/// One publish as the mock broker saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// In-process stand-in for a broker.
#[derive(Debug, Default)]
pub struct MockBroker {
    connect_attempts: AtomicUsize,
    fail_next_connects: AtomicUsize,
    fail_next_subscribes: AtomicUsize,
    fail_publishes: AtomicBool,
    last_options: Mutex<Option<SessionOptions>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    unsubscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<RecordedPublish>>,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A session factory whose sessions talk to this broker.
    pub fn factory(broker: &Arc<Self>) -> Arc<dyn SessionFactory> {
        Arc::new(MockSessionFactory {
            broker: Arc::clone(broker),
        })
    }

    /// Script the next `n` connect attempts to fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next_connects.store(n, Ordering::SeqCst);
    }

    /// Script the next `n` subscribe calls to fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.fail_next_subscribes.store(n, Ordering::SeqCst);
    }

    /// Make publish calls fail until cleared.
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub async fn last_open_options(&self) -> Option<SessionOptions> {
        self.last_options.lock().await.clone()
    }

    pub async fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn get_unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().await.clone()
    }

    pub async fn get_published(&self) -> Vec<RecordedPublish> {
        self.published.lock().await.clone()
    }

    /// Publishes recorded for one topic, in order.
    pub async fn published_on(&self, topic: &str) -> Vec<RecordedPublish> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Push a message into the live session's inbound stream. Returns false
    /// if no session is live.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let sender = self.inbound.lock().await.clone();
        match sender {
            Some(tx) => tx.send(InboundMessage::new(topic, payload)).await.is_ok(),
            None => false,
        }
    }

    /// Kill the live session's stream, as a dropped connection would.
    pub async fn drop_session(&self) {
        self.inbound.lock().await.take();
    }

    pub async fn has_live_session(&self) -> bool {
        self.inbound.lock().await.is_some()
    }

    async fn open_session(
        self: &Arc<Self>,
        options: &SessionOptions,
    ) -> Result<(Box<dyn Session>, mpsc::Receiver<InboundMessage>), MqttError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().await = Some(options.clone());

        if take_one(&self.fail_next_connects) {
            return Err(MqttError::ConnectionFailed(
                "scripted connect failure".to_string().into(),
            ));
        }

        let (tx, rx) = mpsc::channel(MOCK_INBOUND_BUFFER);
        *self.inbound.lock().await = Some(tx);

        let session = MockSession {
            broker: Arc::clone(self),
        };
        Ok((Box::new(session), rx))
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Session factory handing out sessions bound to one `MockBroker`.
pub struct MockSessionFactory {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn open(
        &self,
        options: &SessionOptions,
    ) -> Result<(Box<dyn Session>, mpsc::Receiver<InboundMessage>), MqttError> {
        self.broker.open_session(options).await
    }
}

struct MockSession {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        if take_one(&self.broker.fail_next_subscribes) {
            return Err(MqttError::SubscribeFailed {
                topic: topic.to_string(),
                source: "scripted subscribe failure".to_string().into(),
            });
        }
        self.broker
            .subscriptions
            .lock()
            .await
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.broker
            .unsubscriptions
            .lock()
            .await
            .push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                source: "scripted publish failure".to_string().into(),
            });
        }
        self.broker.published.lock().await.push(RecordedPublish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), MqttError> {
        self.broker.inbound.lock().await.take();
        Ok(())
    }
}
