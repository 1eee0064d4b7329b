use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MATCH_RADIUS_KM: f64 = 5.0;
pub const MAX_MATCH_RADIUS_KM: f64 = 50.0;

/// Service catalogue a worker can be indexed under.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Ride,
    Food,
    Freight,
    Rescue,
    Fix,
    Money,
    Courier,
}

impl ServiceType {
    pub const ALL: [ServiceType; 7] = [
        ServiceType::Ride,
        ServiceType::Food,
        ServiceType::Freight,
        ServiceType::Rescue,
        ServiceType::Fix,
        ServiceType::Money,
        ServiceType::Courier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Ride => "ride",
            ServiceType::Food => "food",
            ServiceType::Freight => "freight",
            ServiceType::Rescue => "rescue",
            ServiceType::Fix => "fix",
            ServiceType::Money => "money",
            ServiceType::Courier => "courier",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim().to_ascii_lowercase();
        ServiceType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == needle)
            .ok_or_else(|| ValidationError::new(format!("unknown service type '{value}'")))
    }
}

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Build a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> Result<Self, ValidationError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(ValidationError::new(format!(
                "latitude {lat} is outside [-90, 90]"
            )));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(ValidationError::new(format!(
                "longitude {lng} is outside [-180, 180]"
            )));
        }
        Ok(Self { lat, lng })
    }
}

/// Dispatch request as enqueued by the booking service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequestMessage {
    pub request_id: String,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub service_type: ServiceType,
    #[serde(default, alias = "maxRadius", skip_serializing_if = "Option::is_none")]
    pub max_radius_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Validated form of [`DispatchRequestMessage`] consumed by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub request_id: String,
    pub service_type: ServiceType,
    pub pickup: GeoPoint,
    pub max_radius_km: f64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentEvent {
    pub request_id: String,
    pub worker_id: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Push,
}

/// Worker-targeted alert for the notification service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNotification {
    pub user_id: String,
    pub request_id: String,
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub worker_id: String,
    #[serde(default)]
    pub service_type: ServiceType,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    JumpDetected,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::JumpDetected => "jump_detected",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AnomalyDetails {
    pub speed: f64,
    pub distance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FraudAnomalyEvent {
    pub user_id: String,
    pub anomaly_type: AnomalyKind,
    pub details: AnomalyDetails,
}

/// Lifecycle step announced by the booking service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Created,
    Updated,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Created => "created",
            BookingStatus::Updated => "updated",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

/// Booking lifecycle message published on `booking.<status>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingUpdate {
    pub event: BookingStatus,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, alias = "driverId", skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Which payload a queue carries. Bodies on the wire are the bare JSON
/// payload, so the consumer names the kind it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    DispatchRequested,
    BookingAssigned,
    BookingUpdated,
    WorkerNotified,
    LocationSampled,
    AnomalyDetected,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::DispatchRequested => "dispatch_requested",
            EnvelopeKind::BookingAssigned => "booking_assigned",
            EnvelopeKind::BookingUpdated => "booking_updated",
            EnvelopeKind::WorkerNotified => "worker_notified",
            EnvelopeKind::LocationSampled => "location_sampled",
            EnvelopeKind::AnomalyDetected => "anomaly_detected",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of messages carried by the broker.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Envelope {
    DispatchRequested(DispatchRequestMessage),
    BookingAssigned(AssignmentEvent),
    BookingUpdated(BookingUpdate),
    WorkerNotified(WorkerNotification),
    LocationSampled(LocationSample),
    AnomalyDetected(FraudAnomalyEvent),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::DispatchRequested(_) => EnvelopeKind::DispatchRequested,
            Envelope::BookingAssigned(_) => EnvelopeKind::BookingAssigned,
            Envelope::BookingUpdated(_) => EnvelopeKind::BookingUpdated,
            Envelope::WorkerNotified(_) => EnvelopeKind::WorkerNotified,
            Envelope::LocationSampled(_) => EnvelopeKind::LocationSampled,
            Envelope::AnomalyDetected(_) => EnvelopeKind::AnomalyDetected,
        }
    }

    /// The bare payload as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a bare payload as `kind`.
    pub fn decode(kind: EnvelopeKind, body: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EnvelopeKind::DispatchRequested => {
                Envelope::DispatchRequested(serde_json::from_slice(body)?)
            }
            EnvelopeKind::BookingAssigned => Envelope::BookingAssigned(serde_json::from_slice(body)?),
            EnvelopeKind::BookingUpdated => Envelope::BookingUpdated(serde_json::from_slice(body)?),
            EnvelopeKind::WorkerNotified => Envelope::WorkerNotified(serde_json::from_slice(body)?),
            EnvelopeKind::LocationSampled => Envelope::LocationSampled(serde_json::from_slice(body)?),
            EnvelopeKind::AnomalyDetected => Envelope::AnomalyDetected(serde_json::from_slice(body)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a raw dispatch message and resolve its search radius.
///
/// `default_radius_km` applies when the message carries no radius. A radius
/// must be positive; one above `radius_cap_km` is clamped to the cap.
pub fn normalize_dispatch_request(
    message: DispatchRequestMessage,
    default_radius_km: f64,
    radius_cap_km: f64,
    now: DateTime<Utc>,
) -> Result<DispatchRequest, ValidationError> {
    let request_id = message.request_id.trim().to_string();
    if request_id.is_empty() {
        return Err(ValidationError::new("requestId cannot be empty"));
    }

    let pickup = GeoPoint::new(message.pickup_lat, message.pickup_lng)?;

    let radius_km = message.max_radius_km.unwrap_or(default_radius_km);
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(ValidationError::new(
            "maxRadiusKm must be a positive number",
        ));
    }

    Ok(DispatchRequest {
        request_id,
        service_type: message.service_type,
        pickup,
        max_radius_km: radius_km.min(radius_cap_km),
        submitted_at: message.submitted_at.unwrap_or(now),
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn message() -> DispatchRequestMessage {
        DispatchRequestMessage {
            request_id: "req-1".to_string(),
            pickup_lat: 52.52,
            pickup_lng: 13.405,
            service_type: ServiceType::Ride,
            max_radius_km: None,
            submitted_at: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    #[test]
    fn normalize_applies_default_radius_and_submission_time() {
        let request = normalize_dispatch_request(message(), 5.0, 50.0, now())
            .expect("request should normalize");

        assert_eq!(request.max_radius_km, 5.0);
        assert_eq!(request.submitted_at, now());
        assert_eq!(request.pickup, GeoPoint { lat: 52.52, lng: 13.405 });
    }

    #[test]
    fn normalize_rejects_blank_request_id() {
        let mut raw = message();
        raw.request_id = "  ".to_string();

        let error = normalize_dispatch_request(raw, 5.0, 50.0, now())
            .expect_err("blank id should fail");
        assert_eq!(error.message(), "requestId cannot be empty");
    }

    #[test]
    fn normalize_rejects_non_positive_radius() {
        let mut raw = message();
        raw.max_radius_km = Some(0.0);
        assert!(normalize_dispatch_request(raw.clone(), 5.0, 50.0, now()).is_err());

        raw.max_radius_km = Some(f64::NAN);
        assert!(normalize_dispatch_request(raw, 5.0, 50.0, now()).is_err());
    }

    #[test]
    fn normalize_clamps_radius_above_cap() {
        let mut raw = message();
        raw.max_radius_km = Some(60.0);

        let request = normalize_dispatch_request(raw, 5.0, 50.0, now())
            .expect("oversized radius is clamped, not rejected");
        assert_eq!(request.max_radius_km, 50.0);
    }

    #[test]
    fn normalize_rejects_out_of_range_pickup() {
        let mut raw = message();
        raw.pickup_lat = 91.0;

        let error = normalize_dispatch_request(raw, 5.0, 50.0, now())
            .expect_err("latitude above 90 should fail");
        assert!(error.message().contains("latitude"));
    }

    #[test]
    fn dispatch_message_reads_booking_service_json() {
        let raw = json!({
            "requestId": "req-9",
            "pickupLat": 1.5,
            "pickupLng": 2.5,
            "serviceType": "courier",
            "maxRadiusKm": 3.0
        });

        let parsed: DispatchRequestMessage = serde_json::from_value(raw).expect("valid message");
        assert_eq!(parsed.service_type, ServiceType::Courier);
        assert_eq!(parsed.max_radius_km, Some(3.0));
        assert!(parsed.submitted_at.is_none());
    }

    #[test]
    fn envelope_serializes_the_bare_payload() {
        let envelope = Envelope::WorkerNotified(WorkerNotification {
            user_id: "drv-1".to_string(),
            request_id: "req-1".to_string(),
            channel: NotificationChannel::Push,
        });

        let value = serde_json::to_value(&envelope).expect("serializable");
        assert_eq!(
            value,
            json!({ "userId": "drv-1", "requestId": "req-1", "type": "push" })
        );
    }

    #[test]
    fn decode_reads_booking_service_dispatch_body() {
        let body = br#"{"requestId":"req-3","pickupLat":40.4,"pickupLng":-3.7,"serviceType":"ride","maxRadius":8}"#;

        match Envelope::decode(EnvelopeKind::DispatchRequested, body).expect("bare body decodes") {
            Envelope::DispatchRequested(message) => {
                assert_eq!(message.request_id, "req-3");
                assert_eq!(message.max_radius_km, Some(8.0));
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn decode_rejects_payload_of_another_kind() {
        let body = br#"{"userId":"drv-1","requestId":"req-1","type":"push"}"#;

        assert!(Envelope::decode(EnvelopeKind::LocationSampled, body).is_err());
        assert!(Envelope::decode(EnvelopeKind::DispatchRequested, b"{not json").is_err());
    }

    #[test]
    fn booking_update_accepts_driver_id() {
        let body = br#"{"event":"completed","requestId":"req-5","customerId":"c-1","driverId":"drv-2","serviceType":"ride"}"#;

        match Envelope::decode(EnvelopeKind::BookingUpdated, body).expect("decodes") {
            Envelope::BookingUpdated(update) => {
                assert_eq!(update.event, BookingStatus::Completed);
                assert_eq!(update.worker_id.as_deref(), Some("drv-2"));
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn anomaly_event_matches_fraud_exchange_shape() {
        let event = FraudAnomalyEvent {
            user_id: "drv-7".to_string(),
            anomaly_type: AnomalyKind::JumpDetected,
            details: AnomalyDetails {
                speed: 600.0,
                distance: 300.0,
            },
        };

        let value = serde_json::to_value(&event).expect("serializable");
        assert_eq!(value["anomalyType"], "jump_detected");
        assert_eq!(value["details"]["speed"], 600.0);
    }

    #[test]
    fn service_type_parses_case_insensitively() {
        assert_eq!("Freight".parse::<ServiceType>(), Ok(ServiceType::Freight));
        assert!("boat".parse::<ServiceType>().is_err());
    }

    #[test]
    fn service_type_defaults_to_ride() {
        assert_eq!(ServiceType::default(), ServiceType::Ride);
    }

    #[test]
    fn notification_channels_other_than_push_are_refused() {
        let body = json!({ "userId": "drv-1", "requestId": "req-1", "type": "sms" });

        assert!(serde_json::from_value::<WorkerNotification>(body).is_err());
    }
}
