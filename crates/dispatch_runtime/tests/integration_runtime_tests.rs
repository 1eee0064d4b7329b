use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use dispatch_contract::contract::{Envelope, EnvelopeKind, ServiceType};
use dispatch_contract::topology::{
    BOOKINGS_EXCHANGE, BOOKING_ASSIGNED_KEY, BOOKING_COMPLETED_KEY, BOOKING_UPDATES_QUEUE,
    DRIVER_MATCHING_QUEUE,
};
use dispatch_core::channel::{
    ChannelError, Connector, ExchangeKind, MemoryConsumer, MessageChannel, MessageConsumer,
    QueueOptions,
};
use dispatch_core::config::DispatchConfig;
use dispatch_core::test_helpers::{dispatch_message, TEST_LAT, TEST_LNG};
use dispatch_runtime::{DispatchRuntime, RuntimeError};

const WAIT: Duration = Duration::from_secs(3);

fn test_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.gateway.addr = "127.0.0.1:0".to_string();
    config.gateway.static_tokens =
        HashMap::from([("driver-token".to_string(), "driver-1".to_string())]);
    config.matching.consumers = 2;
    config
}

async fn next_assignment(consumer: &mut MemoryConsumer) -> (String, String) {
    let delivery = tokio::time::timeout(WAIT, consumer.next())
        .await
        .expect("assignment in time")
        .expect("delivery");
    let assigned = match Envelope::decode(EnvelopeKind::BookingAssigned, delivery.body()) {
        Ok(Envelope::BookingAssigned(event)) => (event.request_id, event.worker_id),
        other => panic!("unexpected {other:?}"),
    };
    delivery.ack().expect("ack");
    assigned
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn driver_is_assigned_released_on_completion_and_assigned_again() {
    let runtime = DispatchRuntime::in_memory(test_config()).expect("runtime");
    let broker = runtime.connector().clone();
    let shutdown = CancellationToken::new();
    let running = runtime.start(shutdown.clone()).await.expect("start");

    let channel = broker.connect().await.expect("connect");
    channel
        .declare_exchange(BOOKINGS_EXCHANGE, ExchangeKind::Topic)
        .await
        .expect("exchange");
    channel
        .declare_queue("capture", QueueOptions::default())
        .await
        .expect("capture queue");
    channel
        .bind("capture", BOOKINGS_EXCHANGE, BOOKING_ASSIGNED_KEY)
        .await
        .expect("bind");

    let stream = TcpStream::connect(running.gateway_addr()).await.expect("connect gateway");
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    for event in [
        json!({ "event": "authenticate", "data": { "token": "driver-token" } }),
        json!({ "event": "update_location", "data": { "lat": TEST_LAT, "lng": TEST_LNG + 0.003 } }),
    ] {
        writer
            .write_all(format!("{event}\n").as_bytes())
            .await
            .expect("send");
    }
    let greeting = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .expect("greeting in time")
        .expect("read")
        .expect("line");
    assert!(greeting.contains("authenticated"));
    wait_until("driver indexed", || {
        runtime.index().get("driver-1", ServiceType::Ride).is_some()
    })
    .await;

    wait_until("matching consumers subscribed", || {
        broker.consumer_count(DRIVER_MATCHING_QUEUE) == Some(2)
    })
    .await;
    channel
        .send_to_queue(
            DRIVER_MATCHING_QUEUE,
            &Envelope::DispatchRequested(dispatch_message("req-42")),
        )
        .await
        .expect("enqueue");

    let mut consumer = channel.consume("capture").await.expect("consume");
    assert_eq!(
        next_assignment(&mut consumer).await,
        ("req-42".to_string(), "driver-1".to_string())
    );
    assert_eq!(runtime.ledger().assignment_for("req-42").as_deref(), Some("driver-1"));

    wait_until("lifecycle consumer subscribed", || {
        broker.consumer_count(BOOKING_UPDATES_QUEUE) == Some(1)
    })
    .await;
    broker
        .inject(
            BOOKINGS_EXCHANGE,
            BOOKING_COMPLETED_KEY,
            br#"{"event":"completed","requestId":"req-42","driverId":"driver-1"}"#,
        )
        .expect("publish completion");
    wait_until("driver released", || {
        runtime.ledger().current_request("driver-1").is_none()
    })
    .await;

    channel
        .send_to_queue(
            DRIVER_MATCHING_QUEUE,
            &Envelope::DispatchRequested(dispatch_message("req-43")),
        )
        .await
        .expect("enqueue second request");
    assert_eq!(
        next_assignment(&mut consumer).await,
        ("req-43".to_string(), "driver-1".to_string())
    );

    shutdown.cancel();
    tokio::time::timeout(WAIT, running.wait())
        .await
        .expect("components stop")
        .expect("clean shutdown");
}

#[tokio::test]
async fn broker_outage_beyond_retry_budget_stops_every_component() {
    let mut config = test_config();
    config.broker.reconnect_attempts = 2;
    config.broker.reconnect_base_delay_ms = 1;
    config.broker.reconnect_max_delay_ms = 5;
    let runtime = DispatchRuntime::in_memory(config).expect("runtime");
    runtime.connector().set_accepting_connections(false);

    let result = tokio::time::timeout(WAIT, runtime.run(CancellationToken::new()))
        .await
        .expect("runtime gives up in time");

    match result {
        Err(RuntimeError::Channel { source, .. }) => {
            assert_eq!(source, ChannelError::ReconnectExhausted { attempts: 2 });
        }
        other => panic!("expected reconnect exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn occupied_gateway_address_fails_start() {
    let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let mut config = test_config();
    config.gateway.addr = holder.local_addr().expect("addr").to_string();
    let runtime = DispatchRuntime::in_memory(config).expect("runtime");

    let result = runtime.start(CancellationToken::new()).await;

    assert!(matches!(result, Err(RuntimeError::Gateway(_))));
}
