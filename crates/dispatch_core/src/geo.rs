//! Great-circle math on a spherical Earth.
//!
//! Distances use the haversine formula with a 6371 km radius. This is an
//! approximation adequate for city-scale radii, not a geodesic solution.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use dispatch_contract::contract::GeoPoint;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("invalid coordinate ({lat}, {lng})")]
    InvalidCoordinate { lat: f64, lng: f64 },
}

/// Haversine distance between two points in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Average speed in km/h implied by moving between two timestamped points.
///
/// Zero elapsed time yields zero speed rather than a division fault.
pub fn implied_speed_kmh(distance_km: f64, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let elapsed_ms = (to - from).num_milliseconds().unsigned_abs();
    if elapsed_ms == 0 {
        return 0.0;
    }
    let elapsed_hours = elapsed_ms as f64 / 3_600_000.0;
    distance_km / elapsed_hours
}

/// Convert to an H3 coordinate, rejecting NaN and out-of-range input.
pub fn to_lat_lng(point: GeoPoint) -> Result<h3o::LatLng, GeoError> {
    GeoPoint::new(point.lat, point.lng).map_err(|_| GeoError::InvalidCoordinate {
        lat: point.lat,
        lng: point.lng,
    })?;
    h3o::LatLng::new(point.lat, point.lng).map_err(|_| GeoError::InvalidCoordinate {
        lat: point.lat,
        lng: point.lng,
    })
}

/// Point `distance_km` due north of `origin`.
pub fn offset_north(origin: GeoPoint, distance_km: f64) -> GeoPoint {
    let delta_deg = (distance_km / EARTH_RADIUS_KM).to_degrees();
    GeoPoint {
        lat: (origin.lat + delta_deg).clamp(-90.0, 90.0),
        lng: origin.lng,
    }
}
