mod support;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dispatch_contract::contract::{
    DispatchRequestMessage, Envelope, EnvelopeKind, NotificationChannel, ServiceType,
};
use dispatch_contract::topology::{
    dead_letter_queue, BOOKINGS_EXCHANGE, BOOKING_ASSIGNED_KEY, BOOKING_COMPLETED_KEY,
    BOOKING_UPDATES_QUEUE, DRIVER_MATCHING_QUEUE, DRIVER_NEW_REQUEST_KEY, NOTIFICATIONS_EXCHANGE,
};
use dispatch_core::channel::{
    Connector, ExchangeKind, InMemoryBroker, MessageChannel, ReconnectPolicy, Supervisor,
};
use dispatch_core::clock::{Clock, ManualClock};
use dispatch_core::matching::{
    lifecycle_subscription, matching_subscription, matching_supervisor, BookingLifecycle,
    InMemoryAssignmentLedger, LedgerMode, MatchingSettings, MatchingWorker,
};
use dispatch_core::spatial::DriverGeoIndex;
use dispatch_core::test_helpers::{dispatch_message, test_clock, test_index, TEST_LAT, TEST_LNG};

use support::broker::{capture, spawn_consumer, take, wait_for_consumers};
use support::{eventually, settle};

const ASSIGNED_CAPTURE: &str = "capture.booking-assigned";
const NOTIFIED_CAPTURE: &str = "capture.driver-new-request";

struct MatchingFixture {
    broker: InMemoryBroker,
    index: Arc<DriverGeoIndex>,
    ledger: Arc<InMemoryAssignmentLedger>,
    clock: Arc<ManualClock>,
    shutdown: CancellationToken,
}

impl MatchingFixture {
    /// Start `consumers` competing matching workers sharing one index and ledger.
    async fn start(consumers: usize) -> Self {
        let broker = InMemoryBroker::new();
        let clock = test_clock();
        let index = test_index(clock.clone());
        let ledger = Arc::new(InMemoryAssignmentLedger::new(LedgerMode::Permissive));
        let shutdown = CancellationToken::new();

        capture(&broker, BOOKINGS_EXCHANGE, ExchangeKind::Topic, BOOKING_ASSIGNED_KEY, ASSIGNED_CAPTURE).await;
        capture(
            &broker,
            NOTIFICATIONS_EXCHANGE,
            ExchangeKind::Topic,
            DRIVER_NEW_REQUEST_KEY,
            NOTIFIED_CAPTURE,
        )
        .await;
        let channel = broker.connect().await.expect("connect");
        matching_subscription()
            .declare(&channel)
            .await
            .expect("declare matching queue");

        let supervisor = Arc::new(matching_supervisor(broker.clone(), ReconnectPolicy::default()));
        let worker = Arc::new(MatchingWorker::new(
            index.clone(),
            ledger.clone(),
            clock.clone(),
            MatchingSettings::default(),
        ));
        for _ in 0..consumers {
            spawn_consumer(
                supervisor.clone(),
                matching_subscription(),
                worker.clone(),
                shutdown.clone(),
            );
        }
        spawn_consumer(
            supervisor.clone(),
            lifecycle_subscription(),
            Arc::new(BookingLifecycle::new(ledger.clone())),
            shutdown.clone(),
        );
        wait_for_consumers(&broker, DRIVER_MATCHING_QUEUE, consumers).await;
        wait_for_consumers(&broker, BOOKING_UPDATES_QUEUE, 1).await;

        Self {
            broker,
            index,
            ledger,
            clock,
            shutdown,
        }
    }

    async fn enqueue(&self, message: DispatchRequestMessage) {
        let publisher = Supervisor::new(self.broker.clone(), ReconnectPolicy::default());
        let channel = publisher.channel().await.expect("channel");
        let routed = channel
            .send_to_queue(DRIVER_MATCHING_QUEUE, &Envelope::DispatchRequested(message))
            .await
            .expect("enqueue");
        assert_eq!(routed, 1);
    }

    fn assigned_worker(envelopes: &[Envelope]) -> (String, String) {
        match envelopes {
            [Envelope::BookingAssigned(event)] => (event.request_id.clone(), event.worker_id.clone()),
            other => panic!("unexpected assignment envelopes: {other:?}"),
        }
    }

    fn depth(&self, queue: &str) -> usize {
        self.broker.queue_depth(queue).unwrap_or(0)
    }
}

impl Drop for MatchingFixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn one_indexed_worker_yields_exactly_one_assignment() {
    let fx = MatchingFixture::start(1).await;
    fx.index
        .upsert("driver-1", ServiceType::Ride, TEST_LAT + 0.005, TEST_LNG)
        .expect("indexed");

    fx.enqueue(dispatch_message("req-1")).await;

    match take(&fx.broker, ASSIGNED_CAPTURE, EnvelopeKind::BookingAssigned, 1).await.as_slice() {
        [Envelope::BookingAssigned(event)] => {
            assert_eq!(event.request_id, "req-1");
            assert_eq!(event.worker_id, "driver-1");
            assert_eq!(event.assigned_at, fx.clock.now());
        }
        other => panic!("unexpected assignment envelopes: {other:?}"),
    }
    match take(&fx.broker, NOTIFIED_CAPTURE, EnvelopeKind::WorkerNotified, 1).await.as_slice() {
        [Envelope::WorkerNotified(notification)] => {
            assert_eq!(notification.user_id, "driver-1");
            assert_eq!(notification.channel, NotificationChannel::Push);
        }
        other => panic!("unexpected notification envelopes: {other:?}"),
    }
    settle().await;
    assert_eq!(fx.depth(ASSIGNED_CAPTURE), 0);
    assert_eq!(fx.ledger.current_request("driver-1").as_deref(), Some("req-1"));
}

#[tokio::test]
async fn no_indexed_workers_acks_without_events() {
    let fx = MatchingFixture::start(1).await;

    fx.enqueue(dispatch_message("req-lonely")).await;

    eventually("request consumed", || fx.depth(DRIVER_MATCHING_QUEUE) == 0).await;
    settle().await;
    assert_eq!(fx.depth(ASSIGNED_CAPTURE), 0);
    assert_eq!(fx.depth(NOTIFIED_CAPTURE), 0);
    assert_eq!(fx.depth(&dead_letter_queue(DRIVER_MATCHING_QUEUE)), 0);
    assert_eq!(fx.depth(DRIVER_MATCHING_QUEUE), 0);
    assert_eq!(fx.ledger.assignment_for("req-lonely"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_consumers_assign_a_duplicated_request_once() {
    let fx = MatchingFixture::start(3).await;
    for (i, worker) in ["driver-1", "driver-2", "driver-3"].iter().enumerate() {
        fx.index
            .upsert(worker, ServiceType::Ride, TEST_LAT + 0.002 * (i + 1) as f64, TEST_LNG)
            .expect("indexed");
    }

    for _ in 0..4 {
        fx.enqueue(dispatch_message("req-dup")).await;
    }

    eventually("duplicates consumed", || fx.depth(DRIVER_MATCHING_QUEUE) == 0).await;
    let assigned = take(&fx.broker, ASSIGNED_CAPTURE, EnvelopeKind::BookingAssigned, 1).await;
    settle().await;

    assert_eq!(assigned.len(), 1);
    assert_eq!(fx.depth(ASSIGNED_CAPTURE), 0, "request assigned more than once");
    assert_eq!(fx.depth(&dead_letter_queue(DRIVER_MATCHING_QUEUE)), 0);
    assert!(fx.ledger.assignment_for("req-dup").is_some());
}

#[tokio::test]
async fn malformed_dispatch_payloads_are_dead_lettered_once() {
    let fx = MatchingFixture::start(1).await;
    let dead_letters = dead_letter_queue(DRIVER_MATCHING_QUEUE);

    let mut blank_id = dispatch_message("   ");
    blank_id.max_radius_km = Some(3.0);
    fx.enqueue(blank_id).await;
    fx.broker
        .inject("", DRIVER_MATCHING_QUEUE, b"{\"requestId\":\"req-cut\",")
        .expect("inject garbage");

    eventually("both messages dead-lettered", || fx.depth(&dead_letters) == 2).await;
    settle().await;
    assert_eq!(fx.depth(DRIVER_MATCHING_QUEUE), 0, "rejected message was redelivered");
    assert_eq!(fx.depth(&dead_letters), 2);
    assert_eq!(fx.depth(ASSIGNED_CAPTURE), 0);
}

#[tokio::test]
async fn bare_dispatch_body_from_another_producer_is_matched() {
    let fx = MatchingFixture::start(1).await;
    fx.index
        .upsert("driver-1", ServiceType::Ride, TEST_LAT + 0.005, TEST_LNG)
        .expect("indexed");
    let body = format!(
        r#"{{"requestId":"req-raw","pickupLat":{TEST_LAT},"pickupLng":{TEST_LNG},"serviceType":"ride","maxRadius":80}}"#
    );

    fx.broker
        .inject("", DRIVER_MATCHING_QUEUE, body.as_bytes())
        .expect("inject request");

    let assigned = take(&fx.broker, ASSIGNED_CAPTURE, EnvelopeKind::BookingAssigned, 1).await;
    assert_eq!(
        MatchingFixture::assigned_worker(&assigned),
        ("req-raw".to_string(), "driver-1".to_string())
    );
    settle().await;
    assert_eq!(fx.depth(&dead_letter_queue(DRIVER_MATCHING_QUEUE)), 0);
}

#[tokio::test]
async fn completed_booking_returns_the_driver_for_the_next_request() {
    let fx = MatchingFixture::start(1).await;
    fx.index
        .upsert("driver-1", ServiceType::Ride, TEST_LAT + 0.005, TEST_LNG)
        .expect("indexed");

    fx.enqueue(dispatch_message("req-1")).await;
    let first = take(&fx.broker, ASSIGNED_CAPTURE, EnvelopeKind::BookingAssigned, 1).await;
    assert_eq!(
        MatchingFixture::assigned_worker(&first),
        ("req-1".to_string(), "driver-1".to_string())
    );

    fx.enqueue(dispatch_message("req-2")).await;
    eventually("busy driver skipped", || fx.depth(DRIVER_MATCHING_QUEUE) == 0).await;
    settle().await;
    assert_eq!(fx.depth(ASSIGNED_CAPTURE), 0);

    fx.broker
        .inject(
            BOOKINGS_EXCHANGE,
            BOOKING_COMPLETED_KEY,
            br#"{"event":"completed","requestId":"req-1","customerId":"c-1","driverId":"driver-1"}"#,
        )
        .expect("publish completion");
    eventually("driver released", || fx.ledger.current_request("driver-1").is_none()).await;

    fx.enqueue(dispatch_message("req-3")).await;
    let second = take(&fx.broker, ASSIGNED_CAPTURE, EnvelopeKind::BookingAssigned, 1).await;
    assert_eq!(
        MatchingFixture::assigned_worker(&second),
        ("req-3".to_string(), "driver-1".to_string())
    );
    assert_eq!(fx.ledger.assignment_for("req-1"), None);
}
