use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use dispatch_contract::contract::AnomalyKind;

pub const INITIAL_TRUST_SCORE: u32 = 100;

/// One detected anomaly. Records are only ever appended.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRecord {
    pub worker_id: String,
    pub kind: AnomalyKind,
    pub lat: f64,
    pub lng: f64,
    pub computed_speed_kmh: f64,
    pub distance_km: f64,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

pub trait AnomalyLog: Send + Sync + 'static {
    fn append(&self, record: AnomalyRecord) -> impl Future<Output = Result<(), String>> + Send;
}

/// Bounded reputation score per worker.
pub trait TrustLedger: Send + Sync + 'static {
    /// Subtract `points`, never going below zero. Returns the new score.
    fn penalize(
        &self,
        worker_id: &str,
        points: u32,
    ) -> impl Future<Output = Result<u32, String>> + Send;
}

#[derive(Debug, Default)]
pub struct InMemoryAnomalyLog {
    records: Mutex<Vec<AnomalyRecord>>,
}

impl InMemoryAnomalyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AnomalyRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn records_for(&self, worker_id: &str) -> Vec<AnomalyRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.worker_id == worker_id)
            .collect()
    }
}

impl AnomalyLog for InMemoryAnomalyLog {
    async fn append(&self, record: AnomalyRecord) -> Result<(), String> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTrustLedger {
    scores: Mutex<HashMap<String, u32>>,
}

impl InMemoryTrustLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score; workers never penalized hold the initial score.
    pub fn score(&self, worker_id: &str) -> u32 {
        self.scores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .copied()
            .unwrap_or(INITIAL_TRUST_SCORE)
    }
}

impl TrustLedger for InMemoryTrustLedger {
    async fn penalize(&self, worker_id: &str, points: u32) -> Result<u32, String> {
        let mut scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);
        let score = scores
            .entry(worker_id.to_string())
            .or_insert(INITIAL_TRUST_SCORE);
        *score = score.saturating_sub(points);
        Ok(*score)
    }
}
