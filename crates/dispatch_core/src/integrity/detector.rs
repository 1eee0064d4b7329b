use chrono::{DateTime, Utc};

use crate::geo::{haversine_km, implied_speed_kmh, GeoPoint};

pub const DEFAULT_SPEED_CEILING_KMH: f64 = 200.0;

/// Movement between two consecutive samples of one worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JumpAssessment {
    pub distance_km: f64,
    pub speed_kmh: f64,
    /// `Some(confidence)` when the implied speed exceeds the ceiling.
    pub confidence: Option<f64>,
}

impl JumpAssessment {
    pub fn is_jump(&self) -> bool {
        self.confidence.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JumpDetector {
    speed_ceiling_kmh: f64,
}

impl Default for JumpDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_CEILING_KMH)
    }
}

impl JumpDetector {
    pub fn new(speed_ceiling_kmh: f64) -> Self {
        Self { speed_ceiling_kmh }
    }

    pub fn speed_ceiling_kmh(&self) -> f64 {
        self.speed_ceiling_kmh
    }

    pub fn assess(
        &self,
        prior: GeoPoint,
        prior_at: DateTime<Utc>,
        current: GeoPoint,
        current_at: DateTime<Utc>,
    ) -> JumpAssessment {
        let distance_km = haversine_km(prior, current);
        let speed_kmh = implied_speed_kmh(distance_km, prior_at, current_at);
        let confidence = (speed_kmh > self.speed_ceiling_kmh)
            .then(|| jump_confidence(speed_kmh, self.speed_ceiling_kmh));
        JumpAssessment {
            distance_km,
            speed_kmh,
            confidence,
        }
    }
}

/// How far past the ceiling a speed is, as a 0-100 score: twice the ceiling
/// and beyond scores 100.
pub fn jump_confidence(speed_kmh: f64, ceiling_kmh: f64) -> f64 {
    ((speed_kmh / ceiling_kmh - 1.0) * 100.0).clamp(0.0, 100.0)
}
