//! Exchange, queue and routing-key names shared by every service.

pub const BOOKINGS_EXCHANGE: &str = "bookings";
pub const NOTIFICATIONS_EXCHANGE: &str = "notifications";
pub const TRACKING_EXCHANGE: &str = "tracking";
pub const FRAUD_EXCHANGE: &str = "fraud";
pub const DEAD_LETTER_EXCHANGE: &str = "dead-letter";

pub const DRIVER_MATCHING_QUEUE: &str = "driver-matching";
pub const FRAUD_TRACKING_QUEUE: &str = "fraud-tracking-monitor";
pub const BOOKING_UPDATES_QUEUE: &str = "booking-updates";

pub const BOOKING_ASSIGNED_KEY: &str = "booking.assigned";
pub const BOOKING_CANCELLED_KEY: &str = "booking.cancelled";
pub const BOOKING_COMPLETED_KEY: &str = "booking.completed";
pub const DRIVER_NEW_REQUEST_KEY: &str = "driver.new_request";
pub const ANOMALY_DETECTED_KEY: &str = "anomaly.detected";

/// Room name observers join to follow a trip.
pub fn trip_room(trip_id: &str) -> String {
    format!("trip:{trip_id}")
}

/// Per-instance queue feeding a gateway's trip relay from the tracking fanout.
pub fn tracking_relay_queue(instance_id: &str) -> String {
    format!("tracking-relay.{instance_id}")
}

/// Queue collecting messages rejected from `source_queue`.
pub fn dead_letter_queue(source_queue: &str) -> String {
    format!("{source_queue}.dead")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trip_room_prefixes_trip_id() {
        assert_eq!(trip_room("t-42"), "trip:t-42");
    }

    #[test]
    fn derived_queue_names_are_stable() {
        assert_eq!(tracking_relay_queue("gw-1"), "tracking-relay.gw-1");
        assert_eq!(dead_letter_queue(DRIVER_MATCHING_QUEUE), "driver-matching.dead");
    }
}
