use std::sync::Arc;

use tracing::debug;

use dispatch_contract::contract::{Envelope, EnvelopeKind};
use dispatch_contract::topology::{tracking_relay_queue, trip_room, TRACKING_EXCHANGE};

use super::protocol::{DriverLocation, ServerEvent};
use super::rooms::TripRooms;
use crate::channel::{
    ExchangeKind, HandlerError, MessageChannel, MessageHandler, QueueOptions, Subscription,
};

/// Exclusive per-instance queue on the tracking fanout, so every gateway
/// instance sees every sample.
pub fn relay_subscription(instance_id: &str) -> Subscription {
    Subscription::new(
        &tracking_relay_queue(instance_id),
        EnvelopeKind::LocationSampled,
        QueueOptions::exclusive(),
    )
    .bind(TRACKING_EXCHANGE, ExchangeKind::Fanout, "")
}

/// Pushes samples that carry a trip id to the sessions joined to that trip.
pub struct TripRelay {
    rooms: Arc<TripRooms>,
}

impl TripRelay {
    pub fn new(rooms: Arc<TripRooms>) -> Self {
        Self { rooms }
    }
}

impl<C: MessageChannel> MessageHandler<C> for TripRelay {
    async fn handle(&self, _channel: &C, envelope: Envelope) -> Result<(), HandlerError> {
        let sample = match envelope {
            Envelope::LocationSampled(sample) => sample,
            other => return Err(HandlerError::Unexpected(other.kind())),
        };
        let Some(trip_id) = sample.trip_id.as_deref() else {
            return Ok(());
        };

        let event = ServerEvent::DriverLocation(DriverLocation::from(&sample));
        let delivered = self
            .rooms
            .broadcast(&trip_room(trip_id), &event, Some(&sample.worker_id));
        debug!(trip_id, worker_id = %sample.worker_id, delivered, "location relayed");
        Ok(())
    }
}
