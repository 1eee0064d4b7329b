use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dispatch_contract::contract::{Envelope, LocationSample};
use dispatch_contract::topology::{trip_room, TRACKING_EXCHANGE};

use super::auth::CredentialVerifier;
use super::protocol::{ClientEvent, LocationUpdate, ServerEvent, SessionInfo};
use super::rooms::{SessionHandle, TripRooms};
use super::GatewayError;
use crate::channel::{Connector, ExchangeKind, ReconnectPolicy, Supervisor};
use crate::clock::Clock;
use crate::spatial::DriverGeoIndex;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Per-session outbound queue depth before events are dropped.
    pub outbound_capacity: usize,
    /// How long a new connection may take to send its credentials.
    pub auth_timeout: Duration,
    /// Longest inbound line accepted before the connection is closed.
    pub max_line_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Supervisor declaring the tracking fanout the gateway publishes to.
pub fn gateway_supervisor<K: Connector>(connector: K, policy: ReconnectPolicy) -> Supervisor<K> {
    Supervisor::new(connector, policy).with_exchange(TRACKING_EXCHANGE, ExchangeKind::Fanout)
}

/// Transport-independent session logic: authentication, location updates
/// and trip room membership.
pub struct LocationGateway<K: Connector> {
    index: Arc<DriverGeoIndex>,
    rooms: Arc<TripRooms>,
    publisher: Arc<Supervisor<K>>,
    verifier: Arc<dyn CredentialVerifier>,
    clock: Arc<dyn Clock>,
    settings: GatewaySettings,
    next_session: AtomicU64,
}

impl<K: Connector> LocationGateway<K> {
    pub fn new(
        index: Arc<DriverGeoIndex>,
        rooms: Arc<TripRooms>,
        publisher: Arc<Supervisor<K>>,
        verifier: Arc<dyn CredentialVerifier>,
        clock: Arc<dyn Clock>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            index,
            rooms,
            publisher,
            verifier,
            clock,
            settings,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn rooms(&self) -> &Arc<TripRooms> {
        &self.rooms
    }

    /// Verify the bearer token and open a session for its worker.
    ///
    /// The returned receiver carries every event destined for the session,
    /// starting with `authenticated`.
    pub fn open_session(
        &self,
        token: &str,
    ) -> Result<(SessionHandle, mpsc::Receiver<ServerEvent>), GatewayError> {
        let worker_id = self.verifier.verify(token).inspect_err(|_| {
            warn!("session refused: invalid credentials");
        })?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.settings.outbound_capacity.max(1));
        let session = SessionHandle::new(id, worker_id, tx);

        session.send(ServerEvent::Authenticated(SessionInfo {
            session_id: id,
            worker_id: session.worker_id.clone(),
        }));
        info!(session_id = id, worker_id = %session.worker_id, "session opened");
        Ok((session, rx))
    }

    /// Apply one client event. Invalid input is answered on the session and
    /// never closes it; an `Err` means the location could not be published.
    pub async fn handle_event(
        &self,
        session: &SessionHandle,
        event: ClientEvent,
    ) -> Result<(), GatewayError> {
        match event {
            ClientEvent::Authenticate(_) => {
                session.send(ServerEvent::error("session is already authenticated"));
                Ok(())
            }
            ClientEvent::UpdateLocation(update) => self.update_location(session, update).await,
            ClientEvent::JoinTrip(trip) => {
                self.rooms.join(&trip_room(&trip.trip_id), session);
                info!(session_id = session.id, trip_id = %trip.trip_id, "joined trip room");
                Ok(())
            }
            ClientEvent::LeaveTrip(trip) => {
                self.rooms.leave(&trip_room(&trip.trip_id), session.id);
                debug!(session_id = session.id, trip_id = %trip.trip_id, "left trip room");
                Ok(())
            }
        }
    }

    async fn update_location(
        &self,
        session: &SessionHandle,
        update: LocationUpdate,
    ) -> Result<(), GatewayError> {
        let service_type = update.service_type.unwrap_or_default();
        if let Err(err) = self
            .index
            .upsert(&session.worker_id, service_type, update.lat, update.lng)
        {
            debug!(session_id = session.id, error = %err, "location update rejected");
            session.send(ServerEvent::error(err.to_string()));
            return Ok(());
        }

        let sample = LocationSample {
            worker_id: session.worker_id.clone(),
            service_type,
            lat: update.lat,
            lng: update.lng,
            heading: update.heading,
            speed: update.speed,
            trip_id: update.trip_id,
            timestamp: self.clock.now(),
        };
        self.publisher
            .publish(TRACKING_EXCHANGE, "", &Envelope::LocationSampled(sample))
            .await?;
        Ok(())
    }

    /// Tear down every room membership. The index entry is left to expire.
    pub fn close_session(&self, session: &SessionHandle) {
        let rooms_left = self.rooms.leave_all(session.id);
        info!(
            session_id = session.id,
            worker_id = %session.worker_id,
            rooms_left,
            "session closed"
        );
    }
}
