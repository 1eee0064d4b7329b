use std::sync::Arc;

use tracing::{debug, error, info, warn};

use dispatch_contract::contract::{
    normalize_dispatch_request, AssignmentEvent, DispatchRequest, DispatchRequestMessage,
    Envelope, EnvelopeKind, NotificationChannel, WorkerNotification,
};
use dispatch_contract::topology::{
    BOOKINGS_EXCHANGE, BOOKING_ASSIGNED_KEY, DEAD_LETTER_EXCHANGE, DRIVER_MATCHING_QUEUE,
    DRIVER_NEW_REQUEST_KEY, NOTIFICATIONS_EXCHANGE,
};

use super::ledger::AssignmentLedger;
use super::types::{ClaimOutcome, MatchOutcome, MatchingSettings};
use crate::channel::{
    Connector, ExchangeKind, HandlerError, MessageChannel, MessageHandler, QueueOptions,
    ReconnectPolicy, Subscription, Supervisor,
};
use crate::clock::Clock;
use crate::spatial::{DriverGeoIndex, NearbyWorker};

/// The durable request queue, dead-lettering into `driver-matching.dead`.
pub fn matching_subscription() -> Subscription {
    Subscription::new(
        DRIVER_MATCHING_QUEUE,
        EnvelopeKind::DispatchRequested,
        QueueOptions::durable().with_dead_letter(DEAD_LETTER_EXCHANGE, Some(DRIVER_MATCHING_QUEUE)),
    )
}

/// Supervisor declaring the exchanges the matching worker publishes to.
pub fn matching_supervisor<K: Connector>(connector: K, policy: ReconnectPolicy) -> Supervisor<K> {
    Supervisor::new(connector, policy)
        .with_exchange(BOOKINGS_EXCHANGE, ExchangeKind::Topic)
        .with_exchange(NOTIFICATIONS_EXCHANGE, ExchangeKind::Topic)
}

pub struct MatchingWorker<L: AssignmentLedger> {
    index: Arc<DriverGeoIndex>,
    ledger: Arc<L>,
    clock: Arc<dyn Clock>,
    settings: MatchingSettings,
}

impl<L: AssignmentLedger> MatchingWorker<L> {
    pub fn new(
        index: Arc<DriverGeoIndex>,
        ledger: Arc<L>,
        clock: Arc<dyn Clock>,
        settings: MatchingSettings,
    ) -> Self {
        Self {
            index,
            ledger,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &MatchingSettings {
        &self.settings
    }

    /// Run one request through candidate search and assignment.
    pub async fn dispatch<C: MessageChannel>(
        &self,
        channel: &C,
        message: DispatchRequestMessage,
    ) -> Result<MatchOutcome, HandlerError> {
        let requested_radius_km = message.max_radius_km;
        let request = normalize_dispatch_request(
            message,
            self.settings.default_radius_km,
            self.settings.radius_cap_km,
            self.clock.now(),
        )?;
        info!(
            request_id = %request.request_id,
            service_type = %request.service_type,
            radius_km = request.max_radius_km,
            "dispatch request received"
        );
        if requested_radius_km.is_some_and(|radius| radius > request.max_radius_km) {
            debug!(
                request_id = %request.request_id,
                requested_km = requested_radius_km,
                "search radius clamped to cap"
            );
        }

        let candidates = self.index.query_nearby(
            request.pickup.lat,
            request.pickup.lng,
            request.max_radius_km,
            request.service_type,
            self.settings.candidate_limit,
        )?;
        if candidates.is_empty() {
            info!(request_id = %request.request_id, "no drivers nearby");
            return Ok(MatchOutcome::NoCandidates);
        }
        debug!(
            request_id = %request.request_id,
            candidates = candidates.len(),
            "candidates fetched"
        );

        let available = self.filter_available(candidates).await?;
        for candidate in &available {
            let worker_id = candidate.entry.worker_id.as_str();
            let claim = self
                .ledger
                .claim(&request.request_id, worker_id)
                .await
                .map_err(HandlerError::Collaborator)?;
            match claim {
                ClaimOutcome::Assigned => {
                    self.announce(channel, &request, worker_id).await?;
                    info!(
                        request_id = %request.request_id,
                        worker_id,
                        distance_km = candidate.distance_km,
                        "driver assigned"
                    );
                    return Ok(MatchOutcome::Assigned {
                        worker_id: worker_id.to_string(),
                        distance_km: candidate.distance_km,
                    });
                }
                ClaimOutcome::WorkerUnavailable => {
                    debug!(
                        request_id = %request.request_id,
                        worker_id,
                        "driver taken concurrently, trying next"
                    );
                }
                ClaimOutcome::RequestAlreadyAssigned => {
                    info!(request_id = %request.request_id, "request already assigned elsewhere");
                    return Ok(MatchOutcome::AlreadyAssigned);
                }
                ClaimOutcome::UnknownRequest => {
                    warn!(request_id = %request.request_id, "request is not searching, skipped");
                    return Ok(MatchOutcome::NotSearching);
                }
            }
        }

        warn!(
            request_id = %request.request_id,
            candidates = available.len(),
            "no available drivers"
        );
        Ok(MatchOutcome::NoneAvailable)
    }

    async fn filter_available(
        &self,
        candidates: Vec<NearbyWorker>,
    ) -> Result<Vec<NearbyWorker>, HandlerError> {
        let mut available = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let free = self
                .ledger
                .is_available(&candidate.entry.worker_id)
                .await
                .map_err(HandlerError::Collaborator)?;
            if free {
                available.push(candidate);
            }
        }
        Ok(available)
    }

    /// Publish the assignment, then notify the worker.
    ///
    /// An assignment that cannot be published gives its claim back so the
    /// redelivered request can be matched again. A failed notification is
    /// logged only, since the assignment is already out.
    async fn announce<C: MessageChannel>(
        &self,
        channel: &C,
        request: &DispatchRequest,
        worker_id: &str,
    ) -> Result<(), HandlerError> {
        let assigned = Envelope::BookingAssigned(AssignmentEvent {
            request_id: request.request_id.clone(),
            worker_id: worker_id.to_string(),
            assigned_at: self.clock.now(),
        });
        if let Err(err) = channel
            .publish(BOOKINGS_EXCHANGE, BOOKING_ASSIGNED_KEY, &assigned)
            .await
        {
            warn!(
                request_id = %request.request_id,
                worker_id,
                error = %err,
                "assignment not published, releasing claim"
            );
            if let Err(release) = self.ledger.release_claim(&request.request_id, worker_id).await {
                error!(
                    request_id = %request.request_id,
                    worker_id,
                    error = %release,
                    "failed to release claim"
                );
            }
            return Err(err.into());
        }

        let notification = Envelope::WorkerNotified(WorkerNotification {
            user_id: worker_id.to_string(),
            request_id: request.request_id.clone(),
            channel: NotificationChannel::Push,
        });
        if let Err(err) = channel
            .publish(NOTIFICATIONS_EXCHANGE, DRIVER_NEW_REQUEST_KEY, &notification)
            .await
        {
            warn!(
                request_id = %request.request_id,
                worker_id,
                error = %err,
                "driver notification not published"
            );
        }
        Ok(())
    }
}

impl<C, L> MessageHandler<C> for MatchingWorker<L>
where
    C: MessageChannel,
    L: AssignmentLedger,
{
    async fn handle(&self, channel: &C, envelope: Envelope) -> Result<(), HandlerError> {
        match envelope {
            Envelope::DispatchRequested(message) => {
                self.dispatch(channel, message).await.map(|_| ())
            }
            other => Err(HandlerError::Unexpected(other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use dispatch_contract::contract::{GeoPoint, ServiceType};

    use super::*;
    use crate::channel::{ChannelError, InMemoryBroker, MemoryChannel, MessageConsumer};
    use crate::clock::ManualClock;
    use crate::geo::offset_north;
    use crate::matching::ledger::{InMemoryAssignmentLedger, LedgerMode};
    use crate::spatial::GeoIndexConfig;

    const PICKUP: GeoPoint = GeoPoint {
        lat: 51.5074,
        lng: -0.1278,
    };

    struct Fixture {
        broker: InMemoryBroker,
        channel: MemoryChannel,
        index: Arc<DriverGeoIndex>,
        ledger: Arc<InMemoryAssignmentLedger>,
        worker: MatchingWorker<InMemoryAssignmentLedger>,
    }

    async fn fixture(mode: LedgerMode) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 2, 7, 30, 0)
                .single()
                .expect("valid time"),
        ));
        let index = Arc::new(DriverGeoIndex::new(GeoIndexConfig::default(), clock.clone()));
        let ledger = Arc::new(InMemoryAssignmentLedger::new(mode));
        let worker = MatchingWorker::new(
            index.clone(),
            ledger.clone(),
            clock,
            MatchingSettings::default(),
        );

        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.expect("connect");
        for (exchange, queue, key) in [
            (BOOKINGS_EXCHANGE, "assignments", BOOKING_ASSIGNED_KEY),
            (NOTIFICATIONS_EXCHANGE, "notifications", DRIVER_NEW_REQUEST_KEY),
        ] {
            channel.declare_exchange(exchange, ExchangeKind::Topic).await.expect("exchange");
            channel.declare_queue(queue, QueueOptions::default()).await.expect("queue");
            channel.bind(queue, exchange, key).await.expect("bind");
        }

        Fixture {
            broker,
            channel,
            index,
            ledger,
            worker,
        }
    }

    fn place(fixture: &Fixture, worker_id: &str, distance_km: f64) {
        let p = offset_north(PICKUP, distance_km);
        fixture
            .index
            .upsert(worker_id, ServiceType::Ride, p.lat, p.lng)
            .expect("valid coordinate");
    }

    fn request(request_id: &str) -> DispatchRequestMessage {
        DispatchRequestMessage {
            request_id: request_id.to_string(),
            pickup_lat: PICKUP.lat,
            pickup_lng: PICKUP.lng,
            service_type: ServiceType::Ride,
            max_radius_km: None,
            submitted_at: None,
        }
    }

    async fn next_envelope(channel: &MemoryChannel, queue: &str, kind: EnvelopeKind) -> Envelope {
        let mut consumer = channel.consume(queue).await.expect("consume");
        let delivery = consumer.next().await.expect("delivery");
        let envelope = Envelope::decode(kind, delivery.body()).expect("decodes");
        delivery.ack().expect("ack");
        envelope
    }

    #[tokio::test]
    async fn assigns_nearest_available_driver_and_publishes_events() {
        let fx = fixture(LedgerMode::Permissive).await;
        place(&fx, "far", 3.0);
        place(&fx, "near", 1.0);

        let outcome = fx.worker.dispatch(&fx.channel, request("r1")).await.expect("dispatch");

        assert!(matches!(outcome, MatchOutcome::Assigned { ref worker_id, .. } if worker_id == "near"));
        match next_envelope(&fx.channel, "assignments", EnvelopeKind::BookingAssigned).await {
            Envelope::BookingAssigned(event) => {
                assert_eq!(event.request_id, "r1");
                assert_eq!(event.worker_id, "near");
            }
            other => panic!("unexpected {}", other.kind()),
        }
        match next_envelope(&fx.channel, "notifications", EnvelopeKind::WorkerNotified).await {
            Envelope::WorkerNotified(note) => {
                assert_eq!(note.user_id, "near");
                assert_eq!(note.channel, NotificationChannel::Push);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn no_candidates_publishes_nothing() {
        let fx = fixture(LedgerMode::Permissive).await;
        place(&fx, "outside", 8.0);

        let outcome = fx.worker.dispatch(&fx.channel, request("r1")).await.expect("dispatch");

        assert_eq!(outcome, MatchOutcome::NoCandidates);
        assert!(fx.ledger.assignment_for("r1").is_none());
    }

    #[tokio::test]
    async fn unavailable_drivers_are_skipped() {
        let fx = fixture(LedgerMode::Permissive).await;
        place(&fx, "busy", 0.5);
        place(&fx, "free", 2.0);
        fx.ledger.set_available("busy", false);

        let outcome = fx.worker.dispatch(&fx.channel, request("r1")).await.expect("dispatch");

        assert!(matches!(outcome, MatchOutcome::Assigned { ref worker_id, .. } if worker_id == "free"));
    }

    #[tokio::test]
    async fn every_candidate_unavailable_yields_none_available() {
        let fx = fixture(LedgerMode::Strict).await;
        fx.ledger.open_request("r1");
        place(&fx, "offline", 1.0);

        let outcome = fx.worker.dispatch(&fx.channel, request("r1")).await.expect("dispatch");

        assert_eq!(outcome, MatchOutcome::NoneAvailable);
    }

    #[tokio::test]
    async fn second_delivery_of_same_request_is_not_reassigned() {
        let fx = fixture(LedgerMode::Permissive).await;
        place(&fx, "w1", 1.0);
        place(&fx, "w2", 2.0);

        fx.worker.dispatch(&fx.channel, request("r1")).await.expect("dispatch");
        let outcome = fx.worker.dispatch(&fx.channel, request("r1")).await.expect("dispatch");

        assert_eq!(outcome, MatchOutcome::AlreadyAssigned);
        assert_eq!(fx.ledger.assignment_for("r1").as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn cancelled_request_is_not_assigned() {
        let fx = fixture(LedgerMode::Permissive).await;
        place(&fx, "w1", 1.0);
        fx.ledger.cancel_request("r1");

        let outcome = fx.worker.dispatch(&fx.channel, request("r1")).await.expect("dispatch");

        assert_eq!(outcome, MatchOutcome::NotSearching);
    }

    #[tokio::test]
    async fn malformed_request_is_a_handler_error() {
        let fx = fixture(LedgerMode::Permissive).await;
        let err = fx
            .worker
            .dispatch(&fx.channel, request("  "))
            .await
            .expect_err("blank id is malformed");
        assert!(matches!(err, HandlerError::Malformed(_)));
    }

    #[tokio::test]
    async fn handler_rejects_other_envelopes() {
        let fx = fixture(LedgerMode::Permissive).await;
        let envelope = Envelope::WorkerNotified(WorkerNotification {
            user_id: "w1".to_string(),
            request_id: "r1".to_string(),
            channel: NotificationChannel::Push,
        });

        let err = fx.worker.handle(&fx.channel, envelope).await.expect_err("unexpected kind");
        assert!(matches!(
            err,
            HandlerError::Unexpected(EnvelopeKind::WorkerNotified)
        ));
    }

    #[tokio::test]
    async fn unpublished_assignment_is_released_and_matched_on_redelivery() {
        let fx = fixture(LedgerMode::Permissive).await;
        place(&fx, "w1", 1.0);
        fx.broker.sever_connections();

        let err = fx
            .worker
            .dispatch(&fx.channel, request("r1"))
            .await
            .expect_err("closed channel cannot publish");
        assert!(matches!(err, HandlerError::Channel(ChannelError::Closed)));
        assert_eq!(fx.ledger.assignment_for("r1"), None);

        let channel = fx.broker.connect().await.expect("reconnect");
        let outcome = fx.worker.dispatch(&channel, request("r1")).await.expect("redelivery");

        assert!(matches!(outcome, MatchOutcome::Assigned { ref worker_id, .. } if worker_id == "w1"));
        assert_eq!(fx.broker.queue_depth("assignments"), Some(1));
        assert_eq!(fx.broker.queue_depth("notifications"), Some(1));
    }

    #[tokio::test]
    async fn oversized_radius_is_searched_at_the_cap() {
        let fx = fixture(LedgerMode::Permissive).await;
        place(&fx, "w1", 40.0);
        let mut message = request("r1");
        message.max_radius_km = Some(60.0);

        let outcome = fx.worker.dispatch(&fx.channel, message).await.expect("dispatch");

        assert!(matches!(outcome, MatchOutcome::Assigned { ref worker_id, .. } if worker_id == "w1"));
    }
}
