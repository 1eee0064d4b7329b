use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use dispatch_contract::contract::{
    AnomalyDetails, AnomalyKind, Envelope, EnvelopeKind, FraudAnomalyEvent, LocationSample,
};
use dispatch_contract::topology::{
    ANOMALY_DETECTED_KEY, DEAD_LETTER_EXCHANGE, FRAUD_EXCHANGE, FRAUD_TRACKING_QUEUE,
    TRACKING_EXCHANGE,
};

use super::detector::{JumpDetector, DEFAULT_SPEED_CEILING_KMH};
use super::ledger::{AnomalyLog, AnomalyRecord, TrustLedger};
use crate::channel::{
    Connector, ExchangeKind, HandlerError, MessageChannel, MessageHandler, QueueOptions,
    ReconnectPolicy, Subscription, Supervisor,
};
use crate::clock::Clock;
use crate::geo::GeoPoint;

pub const DEFAULT_PRIOR_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_TRUST_PENALTY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegritySettings {
    pub speed_ceiling_kmh: f64,
    pub prior_ttl: Duration,
    pub trust_penalty: u32,
}

impl Default for IntegritySettings {
    fn default() -> Self {
        Self {
            speed_ceiling_kmh: DEFAULT_SPEED_CEILING_KMH,
            prior_ttl: DEFAULT_PRIOR_TTL,
            trust_penalty: DEFAULT_TRUST_PENALTY,
        }
    }
}

/// The monitor's own durable queue on the tracking fanout.
pub fn integrity_subscription() -> Subscription {
    Subscription::new(
        FRAUD_TRACKING_QUEUE,
        EnvelopeKind::LocationSampled,
        QueueOptions::durable().with_dead_letter(DEAD_LETTER_EXCHANGE, Some(FRAUD_TRACKING_QUEUE)),
    )
    .bind(TRACKING_EXCHANGE, ExchangeKind::Fanout, "")
}

pub fn integrity_supervisor<K: Connector>(connector: K, policy: ReconnectPolicy) -> Supervisor<K> {
    Supervisor::new(connector, policy).with_exchange(FRAUD_EXCHANGE, ExchangeKind::Topic)
}

#[derive(Debug, Clone, Copy)]
struct PriorSample {
    point: GeoPoint,
    sampled_at: DateTime<Utc>,
    stored_at: DateTime<Utc>,
}

pub struct IntegrityMonitor<T: TrustLedger, A: AnomalyLog> {
    detector: JumpDetector,
    settings: IntegritySettings,
    priors: Mutex<HashMap<String, PriorSample>>,
    trust: Arc<T>,
    anomalies: Arc<A>,
    clock: Arc<dyn Clock>,
}

impl<T: TrustLedger, A: AnomalyLog> IntegrityMonitor<T, A> {
    pub fn new(
        settings: IntegritySettings,
        trust: Arc<T>,
        anomalies: Arc<A>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            detector: JumpDetector::new(settings.speed_ceiling_kmh),
            settings,
            priors: Mutex::new(HashMap::new()),
            trust,
            anomalies,
            clock,
        }
    }

    fn priors(&self) -> MutexGuard<'_, HashMap<String, PriorSample>> {
        self.priors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compare a sample against the worker's previous one and act on a jump.
    ///
    /// The sample becomes the new prior only after every side effect has
    /// succeeded, so a redelivered sample is judged against the same prior.
    pub async fn inspect<C: MessageChannel>(
        &self,
        channel: &C,
        sample: &LocationSample,
    ) -> Result<Option<AnomalyRecord>, HandlerError> {
        let current = GeoPoint::new(sample.lat, sample.lng)?;
        let now = self.clock.now();

        let record = match self.recent_prior(&sample.worker_id, now) {
            Some(prior) => self.judge(channel, sample, prior, current, now).await?,
            None => {
                debug!(worker_id = %sample.worker_id, "no recent prior sample");
                None
            }
        };

        self.priors().insert(
            sample.worker_id.clone(),
            PriorSample {
                point: current,
                sampled_at: sample.timestamp,
                stored_at: now,
            },
        );
        Ok(record)
    }

    async fn judge<C: MessageChannel>(
        &self,
        channel: &C,
        sample: &LocationSample,
        prior: PriorSample,
        current: GeoPoint,
        now: DateTime<Utc>,
    ) -> Result<Option<AnomalyRecord>, HandlerError> {
        let assessment =
            self.detector
                .assess(prior.point, prior.sampled_at, current, sample.timestamp);
        let Some(confidence) = assessment.confidence else {
            return Ok(None);
        };

        warn!(
            worker_id = %sample.worker_id,
            speed_kmh = assessment.speed_kmh,
            distance_km = assessment.distance_km,
            confidence,
            "location jump detected"
        );
        let event = Envelope::AnomalyDetected(FraudAnomalyEvent {
            user_id: sample.worker_id.clone(),
            anomaly_type: AnomalyKind::JumpDetected,
            details: AnomalyDetails {
                speed: assessment.speed_kmh,
                distance: assessment.distance_km,
            },
        });
        channel
            .publish(FRAUD_EXCHANGE, ANOMALY_DETECTED_KEY, &event)
            .await?;

        let record = AnomalyRecord {
            worker_id: sample.worker_id.clone(),
            kind: AnomalyKind::JumpDetected,
            lat: current.lat,
            lng: current.lng,
            computed_speed_kmh: assessment.speed_kmh,
            distance_km: assessment.distance_km,
            confidence,
            detected_at: now,
        };
        self.anomalies
            .append(record.clone())
            .await
            .map_err(HandlerError::Collaborator)?;
        let score = self
            .trust
            .penalize(&sample.worker_id, self.settings.trust_penalty)
            .await
            .map_err(HandlerError::Collaborator)?;
        debug!(worker_id = %sample.worker_id, trust_score = score, "trust penalized");
        Ok(Some(record))
    }

    /// The worker's prior, unless it is older than the prior TTL.
    fn recent_prior(&self, worker_id: &str, now: DateTime<Utc>) -> Option<PriorSample> {
        self.priors()
            .get(worker_id)
            .copied()
            .filter(|prior| !self.is_stale(prior, now))
    }

    fn is_stale(&self, prior: &PriorSample, now: DateTime<Utc>) -> bool {
        (now - prior.stored_at)
            .to_std()
            .map(|age| age > self.settings.prior_ttl)
            .unwrap_or(false)
    }

    /// Forget priors older than the TTL. Returns how many were dropped.
    pub fn purge_stale_priors(&self) -> usize {
        let now = self.clock.now();
        let mut priors = self.priors();
        let before = priors.len();
        priors.retain(|_, prior| !self.is_stale(prior, now));
        before - priors.len()
    }

    pub fn tracked_workers(&self) -> usize {
        self.priors().len()
    }
}

impl<C, T, A> MessageHandler<C> for IntegrityMonitor<T, A>
where
    C: MessageChannel,
    T: TrustLedger,
    A: AnomalyLog,
{
    async fn handle(&self, channel: &C, envelope: Envelope) -> Result<(), HandlerError> {
        match envelope {
            Envelope::LocationSampled(sample) => self.inspect(channel, &sample).await.map(|_| ()),
            other => Err(HandlerError::Unexpected(other.kind())),
        }
    }
}
