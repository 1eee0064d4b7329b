use dispatch_contract::contract::{DEFAULT_MATCH_RADIUS_KM, MAX_MATCH_RADIUS_KM};

pub const DEFAULT_CANDIDATE_LIMIT: usize = 20;

/// Result of processing one dispatch request.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Assigned { worker_id: String, distance_km: f64 },
    /// Nobody indexed within the radius.
    NoCandidates,
    /// Candidates existed but none could be claimed.
    NoneAvailable,
    /// Another consumer already assigned this request.
    AlreadyAssigned,
    /// The request is not open for assignment (cancelled or never opened).
    NotSearching,
}

/// Answer of the ledger's single conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Assigned,
    /// Worker was taken concurrently; try the next candidate.
    WorkerUnavailable,
    RequestAlreadyAssigned,
    UnknownRequest,
}

/// How a request left the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Cancelled,
}

/// What one maintenance sweep of the ledger removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerPurge {
    pub released_workers: usize,
    pub evicted_requests: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingSettings {
    pub default_radius_km: f64,
    pub radius_cap_km: f64,
    pub candidate_limit: usize,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            default_radius_km: DEFAULT_MATCH_RADIUS_KM,
            radius_cap_km: MAX_MATCH_RADIUS_KM,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
        }
    }
}
