//! Startup behavior when no broker is reachable
//!
//! A device agent is often powered on before its network or broker is up.
//! The client must come up anyway, retry in the background, drop outbound
//! traffic quietly, and still shut down cleanly if asked.

use std::time::Duration;
use tetherd::config::MqttSection;
use tetherd::mqtt::{ConnectionState, MqttClient, QoS};
use tokio::time::{sleep, timeout};

/// Section pointing at a port nothing listens on.
fn dead_broker_section(port: u16) -> MqttSection {
    MqttSection {
        device_id: "test-device".to_string(),
        broker_url: format!("mqtt://localhost:{port}"),
        base_topic: Some("device/42".to_string()),
        username_env: None,
        password_env: None,
        keep_alive_secs: 5,
        reconnect_interval_secs: 1,
        connect_timeout_secs: 1,
    }
}

#[tokio::test]
async fn test_construction_succeeds_without_broker() {
    // Building the client resolves configuration only; no socket is opened
    // until connect() is called.
    let client = MqttClient::new(&dead_broker_section(9999))
        .expect("client construction should not require a broker");

    assert!(!client.is_connected());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.topics().base(), "device/42");
}

#[tokio::test]
async fn test_client_retries_in_background_without_broker() {
    let client = MqttClient::new(&dead_broker_section(9998))
        .expect("client construction should not require a broker");

    client.connect().await;

    // Give it time for at least one failed attempt plus the retry wait.
    sleep(Duration::from_millis(2500)).await;

    // Still trying, never connected. Depending on where the loop is we see
    // either Connecting (mid-dial) or Disconnected (between attempts).
    assert!(!client.is_connected());
    assert_ne!(client.state(), ConnectionState::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_publish_without_broker_is_dropped_quietly() {
    let client = MqttClient::new(&dead_broker_section(9997))
        .expect("client construction should not require a broker");

    client.connect().await;
    sleep(Duration::from_millis(300)).await;

    // Telemetry produced while offline is logged and dropped, not an error.
    let result = client
        .publish_json(
            "telemetry",
            &serde_json::json!({"temp_c": 19.0}),
            QoS::AtMostOnce,
            false,
        )
        .await;
    assert!(result.is_ok());

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_while_retrying_is_clean() {
    let client = MqttClient::new(&dead_broker_section(9996))
        .expect("client construction should not require a broker");

    client.connect().await;
    sleep(Duration::from_millis(300)).await;

    // Shutdown must not hang on the retry loop and leaves the client in a
    // well-defined state either way.
    timeout(Duration::from_secs(5), client.disconnect())
        .await
        .expect("disconnect should complete promptly while retrying");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // A second disconnect is a no-op.
    timeout(Duration::from_secs(5), client.disconnect())
        .await
        .expect("repeated disconnect should be a no-op");
}
