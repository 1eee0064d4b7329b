//! Shared fixtures for unit, integration and benchmark code.
//!
//! Everything here is anchored on one reference point and one fixed instant
//! so distances and expiry behave the same across test files.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use dispatch_contract::contract::{DispatchRequestMessage, LocationSample, ServiceType};

use crate::clock::ManualClock;
use crate::spatial::{DriverGeoIndex, GeoIndexConfig};

/// Reference pickup point (Madrid, Puerta del Sol).
pub const TEST_LAT: f64 = 40.416_8;
pub const TEST_LNG: f64 = -3.703_8;

/// Fixed instant every test clock starts from.
///
/// # Panics
///
/// Never in practice; the calendar date is valid.
pub fn test_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0)
        .single()
        .expect("valid test instant")
}

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(test_time()))
}

/// Index with default configuration on `clock`.
pub fn test_index(clock: Arc<ManualClock>) -> Arc<DriverGeoIndex> {
    Arc::new(DriverGeoIndex::new(GeoIndexConfig::default(), clock))
}

/// Ride request at the reference point.
pub fn dispatch_message(request_id: &str) -> DispatchRequestMessage {
    DispatchRequestMessage {
        request_id: request_id.to_string(),
        pickup_lat: TEST_LAT,
        pickup_lng: TEST_LNG,
        service_type: ServiceType::Ride,
        max_radius_km: None,
        submitted_at: Some(test_time()),
    }
}

/// Ride sample without a trip at `(lat, lng)` taken at `timestamp`.
pub fn location_sample(
    worker_id: &str,
    lat: f64,
    lng: f64,
    timestamp: DateTime<Utc>,
) -> LocationSample {
    LocationSample {
        worker_id: worker_id.to_string(),
        service_type: ServiceType::Ride,
        lat,
        lng,
        heading: None,
        speed: None,
        trip_id: None,
        timestamp,
    }
}
