//! Periodic heartbeat publisher
//!
//! Republishes a retained heartbeat on the device's heartbeat topic at a
//! configured interval so monitors can spot a wedged agent even while the
//! broker still holds a stale retained status. A `Notify` trigger forces an
//! immediate beat, which the application wires to the post-connect hook so a
//! fresh beat goes out right after every reconnect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::HeartbeatSection;
use crate::mqtt::topics::HEARTBEAT_LEAF;
use crate::mqtt::{MqttClient, QoS};

/// One heartbeat payload.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub beat: u64,
}

/// Republishes availability at a fixed cadence until stopped.
pub struct HeartbeatService {
    client: Arc<MqttClient>,
    interval: Duration,
    trigger: Arc<Notify>,
    started: Instant,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    pub fn new(client: Arc<MqttClient>, config: &HeartbeatSection) -> Self {
        Self {
            client,
            interval: Duration::from_secs(config.interval_secs),
            trigger: Arc::new(Notify::new()),
            started: Instant::now(),
            handle: None,
        }
    }

    /// Handle for forcing an immediate beat (resets the cadence).
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Spawn the beat loop. Publish failures are logged and the loop keeps
    /// going; the connection manager already handles reconnection.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let client = Arc::clone(&self.client);
        let trigger = Arc::clone(&self.trigger);
        let device_id = client.device_id().to_string();
        let interval = self.interval;
        let started = self.started;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately, skip it
            let mut beat: u64 = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => ticker.reset(),
                }

                beat += 1;
                let payload = Heartbeat {
                    device_id: device_id.clone(),
                    timestamp: Utc::now(),
                    uptime_secs: started.elapsed().as_secs(),
                    beat,
                };

                let value = match serde_json::to_value(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        error!("Heartbeat payload did not serialize: {e}");
                        continue;
                    }
                };

                match client
                    .publish_json(HEARTBEAT_LEAF, &value, QoS::AtMostOnce, true)
                    .await
                {
                    Ok(()) => debug!(beat, "Heartbeat published"),
                    Err(e) => error!("Heartbeat publish failed: {e}"),
                }
            }
        }));

        info!(interval_secs = self.interval.as_secs(), "Heartbeat task started");
    }

    /// Stop the beat loop.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Heartbeat shutdown error: {e}");
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::testing::MockBroker;
    use serde_json::Value;

    async fn connected_client(broker: &Arc<MockBroker>) -> Arc<MqttClient> {
        let settings = Settings::test_config();
        let client =
            Arc::new(MqttClient::with_factory(&settings.mqtt, MockBroker::factory(broker)).unwrap());
        client.connect().await;
        tokio::time::timeout(Duration::from_secs(1), client.wait_until_connected())
            .await
            .expect("client should connect");
        client
    }

    #[tokio::test]
    async fn test_trigger_forces_immediate_beat() {
        let broker = MockBroker::new();
        let client = connected_client(&broker).await;

        let config = HeartbeatSection {
            enabled: true,
            interval_secs: 3600,
        };
        let mut service = HeartbeatService::new(Arc::clone(&client), &config);
        service.start();
        assert!(service.is_running());

        // Interval is an hour; only the trigger can produce a beat now.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.published_on("device/42/heartbeat").await.is_empty());

        service.trigger().notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let beats = broker.published_on("device/42/heartbeat").await;
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].qos, QoS::AtMostOnce);
        assert!(beats[0].retain);

        let body: Value = serde_json::from_slice(&beats[0].payload).unwrap();
        assert_eq!(body["device_id"], "test-device");
        assert_eq!(body["beat"], 1);
        assert!(body["timestamp"].is_string());
        assert!(body["uptime_secs"].is_u64());

        service.stop().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_stop_halts_beats() {
        let broker = MockBroker::new();
        let client = connected_client(&broker).await;

        let config = HeartbeatSection {
            enabled: true,
            interval_secs: 3600,
        };
        let mut service = HeartbeatService::new(Arc::clone(&client), &config);
        service.start();
        service.stop().await;
        assert!(!service.is_running());

        service.trigger().notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(broker.published_on("device/42/heartbeat").await.is_empty());

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_beats_survive_publish_failures() {
        let broker = MockBroker::new();
        let client = connected_client(&broker).await;

        let config = HeartbeatSection {
            enabled: true,
            interval_secs: 3600,
        };
        let mut service = HeartbeatService::new(Arc::clone(&client), &config);
        service.start();

        broker.set_publish_failure(true);
        service.trigger().notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(service.is_running());

        // The failed publish marked the connection lost; beats while
        // disconnected are dropped, and the loop still keeps its cadence.
        broker.set_publish_failure(false);
        service.trigger().notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(service.is_running());

        service.stop().await;
        client.disconnect().await;
    }
}
