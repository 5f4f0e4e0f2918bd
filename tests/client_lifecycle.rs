//! Integration tests for the client lifecycle over a scripted session layer
//!
//! Exercises the behavior that matters for long-running devices:
//! - Recorded subscriptions are replayed in full on every new session
//! - At most one live session exists at any time
//! - `offline` is only announced when a session is actually up
//! - Handler failures are isolated and reported, malformed payloads dropped
//! - Shutdown is idempotent

use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tetherd::config::MqttSection;
use tetherd::mqtt::{handler_fn, MqttClient, QoS};
use tetherd::testing::MockBroker;
use tokio::time::{sleep, timeout};

fn test_section() -> MqttSection {
    MqttSection {
        device_id: "test-device".to_string(),
        broker_url: "mqtt://localhost:1883".to_string(),
        base_topic: Some("device/42".to_string()),
        username_env: None,
        password_env: None,
        keep_alive_secs: 30,
        reconnect_interval_secs: 1,
        connect_timeout_secs: 5,
    }
}

async fn connected_client(broker: &Arc<MockBroker>) -> MqttClient {
    let client = MqttClient::with_factory(&test_section(), MockBroker::factory(broker))
        .expect("client construction should succeed");
    client.connect().await;
    timeout(Duration::from_secs(2), client.wait_until_connected())
        .await
        .expect("client should connect to the mock broker");
    client
}

/// Wait until `condition` holds, or fail after a few seconds.
async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..50 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("Timed out waiting for {what}");
}

#[tokio::test]
async fn test_registry_is_replayed_in_full_on_every_session() {
    let broker = MockBroker::new();
    let client = MqttClient::with_factory(&test_section(), MockBroker::factory(&broker))
        .expect("client construction should succeed");

    // Recorded before any connection exists; includes a duplicate topic with
    // a different QoS, which stays a distinct entry.
    client
        .add_subscriptions(&[
            ("device/42/command".to_string(), QoS::AtLeastOnce),
            ("device/42/config".to_string(), QoS::AtLeastOnce),
            ("device/42/command".to_string(), QoS::ExactlyOnce),
        ])
        .await
        .unwrap();

    client.connect().await;
    timeout(Duration::from_secs(2), client.wait_until_connected())
        .await
        .expect("client should connect");

    let expected = vec![
        ("device/42/command".to_string(), QoS::AtLeastOnce),
        ("device/42/config".to_string(), QoS::AtLeastOnce),
        ("device/42/command".to_string(), QoS::ExactlyOnce),
    ];
    assert_eq!(broker.get_subscriptions().await, expected);

    // Kill the session; the reconnect loop dials again after its fixed
    // interval and must replay the same registry, exactly once.
    broker.drop_session().await;
    {
        let broker = Arc::clone(&broker);
        wait_for(
            move || broker.connect_attempts() == 2,
            "second connection attempt",
        )
        .await;
    }
    timeout(Duration::from_secs(2), client.wait_until_connected())
        .await
        .expect("client should reconnect");

    let all = broker.get_subscriptions().await;
    assert_eq!(all.len(), expected.len() * 2);
    assert_eq!(&all[..expected.len()], expected.as_slice());
    assert_eq!(&all[expected.len()..], expected.as_slice());

    client.disconnect().await;
}

#[tokio::test]
async fn test_at_most_one_live_session_across_reconnects() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;
    assert!(broker.has_live_session().await);
    assert_eq!(broker.connect_attempts(), 1);

    broker.drop_session().await;
    {
        let broker = Arc::clone(&broker);
        wait_for(move || broker.connect_attempts() == 2, "reconnect").await;
    }
    timeout(Duration::from_secs(2), client.wait_until_connected())
        .await
        .expect("client should reconnect");

    assert!(broker.has_live_session().await);
    assert_eq!(broker.connect_attempts(), 2);

    client.disconnect().await;
    assert!(!broker.has_live_session().await);
}

#[tokio::test]
async fn test_connect_retries_until_a_session_opens() {
    let broker = MockBroker::new();
    broker.fail_next_connects(2);

    let client = MqttClient::with_factory(&test_section(), MockBroker::factory(&broker))
        .expect("client construction should succeed");
    client.connect().await;

    // Two scripted refusals, then the dial loop's fixed interval brings it up.
    timeout(Duration::from_secs(10), client.wait_until_connected())
        .await
        .expect("client should connect once the broker accepts");
    assert_eq!(broker.connect_attempts(), 3);

    client.disconnect().await;
}

#[tokio::test]
async fn test_offline_is_not_announced_while_broker_unreachable() {
    let broker = MockBroker::new();
    broker.fail_next_connects(1000);

    let client = MqttClient::with_factory(&test_section(), MockBroker::factory(&broker))
        .expect("client construction should succeed");
    client.connect().await;
    sleep(Duration::from_millis(200)).await;

    client.disconnect().await;

    // Never connected, so neither status was published.
    assert!(broker.get_published().await.is_empty());
    assert!(broker.connect_attempts() >= 1);
}

#[tokio::test]
async fn test_handler_failures_are_isolated_and_reported() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let before = Arc::clone(&calls);
    let after = Arc::clone(&calls);

    client
        .add_subscriptions(&[("device/42/command".to_string(), QoS::AtLeastOnce)])
        .await
        .unwrap();
    client.bind_handler(
        "device/42/command",
        handler_fn("first", move |_topic, _payload| {
            let calls = Arc::clone(&before);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    client.bind_handler(
        "device/42/command",
        handler_fn("boom", |_topic, _payload| async move {
            Err("actuator jammed".into())
        }),
    );
    client.bind_handler(
        "device/42/command",
        handler_fn("last", move |_topic, _payload| {
            let calls = Arc::clone(&after);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    broker
        .inject("device/42/command", br#"{"action":"ping"}"#.to_vec())
        .await;
    {
        let calls = Arc::clone(&calls);
        wait_for(move || calls.load(Ordering::SeqCst) == 2, "both healthy handlers").await;
    }

    let reports = broker.published_on("device/42/message").await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].qos, QoS::ExactlyOnce);
    let body: Value = serde_json::from_slice(&reports[0].payload).unwrap();
    assert_eq!(body["is_error"], true);
    assert!(body["message"].as_str().unwrap().contains("actuator jammed"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_payloads_are_dropped_and_stream_recovers() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);

    client
        .add_subscriptions(&[("device/42/command".to_string(), QoS::AtLeastOnce)])
        .await
        .unwrap();
    client.bind_handler(
        "device/42/command",
        handler_fn("counter", move |_topic, _payload| {
            let handled = Arc::clone(&counter);
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    // Not JSON at all, then JSON that is not an object: both dropped.
    broker
        .inject("device/42/command", b"hello world".to_vec())
        .await;
    broker.inject("device/42/command", b"[1,2,3]".to_vec()).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    // The stream is still alive and well-formed traffic goes through.
    broker
        .inject("device/42/command", br#"{"action":"ping"}"#.to_vec())
        .await;
    {
        let handled = Arc::clone(&handled);
        wait_for(move || handled.load(Ordering::SeqCst) == 1, "valid message").await;
    }

    assert!(broker.published_on("device/42/message").await.is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let broker = MockBroker::new();
    let client = connected_client(&broker).await;

    client.disconnect().await;
    client.disconnect().await;
    client.disconnect().await;

    let offline = broker
        .published_on("device/42/status")
        .await
        .iter()
        .filter(|p| p.payload == br#"{"state":"offline"}"#.to_vec())
        .count();
    assert_eq!(offline, 1);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_device_42_end_to_end() {
    let broker = MockBroker::new();
    let client = MqttClient::with_factory(&test_section(), MockBroker::factory(&broker))
        .expect("client construction should succeed");

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    client
        .add_subscriptions(&[("device/42/command".to_string(), QoS::AtLeastOnce)])
        .await
        .unwrap();
    client.bind_handler(
        "device/42/command",
        handler_fn("record", move |topic, payload| {
            let seen = Arc::clone(&sink);
            async move {
                seen.lock().unwrap().push((topic, Value::Object(payload)));
                Ok(())
            }
        }),
    );

    client.connect().await;
    timeout(Duration::from_secs(2), client.wait_until_connected())
        .await
        .expect("client should connect");

    // The session was opened with a last will guarding against ungraceful
    // death, scoped under the device's base topic.
    let options = broker.last_open_options().await.unwrap();
    let will = options.last_will.expect("session should carry a last will");
    assert_eq!(will.topic, "device/42/status");
    assert_eq!(will.payload, br#"{"state":"offline"}"#.to_vec());
    assert_eq!(will.qos, QoS::ExactlyOnce);
    assert!(will.retain);

    // Online announcement, retained.
    let statuses = broker.published_on("device/42/status").await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].payload, br#"{"state":"online"}"#.to_vec());
    assert!(statuses[0].retain);

    // Inbound command reaches the handler with the decoded payload.
    broker
        .inject("device/42/command", br#"{"action":"ping","level":5}"#.to_vec())
        .await;
    {
        let seen = Arc::clone(&seen);
        wait_for(move || !seen.lock().unwrap().is_empty(), "command dispatch").await;
    }
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "device/42/command");
        assert_eq!(seen[0].1["action"], "ping");
        assert_eq!(seen[0].1["level"], 5);
    }

    // Outbound publishes are namespaced under the base topic.
    client
        .publish_json(
            "telemetry",
            &serde_json::json!({"temp_c": 21.5}),
            QoS::AtMostOnce,
            false,
        )
        .await
        .unwrap();
    let telemetry = broker.published_on("device/42/telemetry").await;
    assert_eq!(telemetry.len(), 1);

    client.disconnect().await;

    let offline = broker
        .published_on("device/42/status")
        .await
        .iter()
        .filter(|p| p.payload == br#"{"state":"offline"}"#.to_vec())
        .count();
    assert_eq!(offline, 1);
}

#[tokio::test]
async fn test_concurrent_publishes_are_all_recorded() {
    let broker = MockBroker::new();
    let client = Arc::new(connected_client(&broker).await);

    // Ten tasks publishing through the same client at once.
    let mut handles = vec![];
    for seq in 0..10u64 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client
                .publish_json(
                    "telemetry",
                    &serde_json::json!({ "seq": seq }),
                    QoS::AtLeastOnce,
                    false,
                )
                .await
        }));
    }
    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    let telemetry = broker.published_on("device/42/telemetry").await;
    assert_eq!(telemetry.len(), 10);
    let mut seqs: Vec<u64> = telemetry
        .iter()
        .map(|p| {
            serde_json::from_slice::<Value>(&p.payload).unwrap()["seq"]
                .as_u64()
                .unwrap()
        })
        .collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..10).collect::<Vec<u64>>());

    client.disconnect().await;
}
