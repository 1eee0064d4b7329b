//! Authoritative availability and assignment state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{ClaimOutcome, LedgerPurge, Settlement};
use crate::clock::{Clock, SystemClock};

/// System of record for who is free and which requests are still open.
///
/// `claim` must be one conditional update: assign iff the request is
/// searching and the worker is available. Errors are collaborator failures.
pub trait AssignmentLedger: Send + Sync + 'static {
    fn is_available(&self, worker_id: &str) -> impl Future<Output = Result<bool, String>> + Send;

    fn claim(
        &self,
        request_id: &str,
        worker_id: &str,
    ) -> impl Future<Output = Result<ClaimOutcome, String>> + Send;

    /// Undo a claim whose assignment was never announced, reopening the
    /// request and freeing the worker. A no-op unless `worker_id` holds it.
    fn release_claim(
        &self,
        request_id: &str,
        worker_id: &str,
    ) -> impl Future<Output = Result<(), String>> + Send;

    /// Close a request. Returns the worker it freed, if any.
    fn settle(
        &self,
        request_id: &str,
        settlement: Settlement,
    ) -> impl Future<Output = Result<Option<String>, String>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerMode {
    /// Requests must be opened and workers marked available explicitly.
    Strict,
    /// Unseen requests count as searching and unseen workers as available.
    #[default]
    Permissive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestState {
    Searching,
    Assigned {
        worker_id: String,
        since: DateTime<Utc>,
    },
    Settled {
        settlement: Settlement,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkerState {
    Available,
    Busy {
        request_id: String,
        since: DateTime<Utc>,
    },
    Offline,
}

#[derive(Debug, Default)]
struct LedgerState {
    requests: HashMap<String, RequestState>,
    workers: HashMap<String, WorkerState>,
}

pub struct InMemoryAssignmentLedger {
    mode: LedgerMode,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl InMemoryAssignmentLedger {
    pub fn new(mode: LedgerMode) -> Self {
        Self::with_clock(mode, Arc::new(SystemClock))
    }

    pub fn with_clock(mode: LedgerMode, clock: Arc<dyn Clock>) -> Self {
        Self {
            mode,
            clock,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn mode(&self) -> LedgerMode {
        self.mode
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_request(&self, request_id: &str) {
        self.state()
            .requests
            .insert(request_id.to_string(), RequestState::Searching);
    }

    /// Cancels a request that has not been assigned yet. Returns false if it
    /// was already assigned.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let at = self.clock.now();
        let mut state = self.state();
        match state.requests.get(request_id) {
            Some(RequestState::Assigned { .. }) => false,
            _ => {
                state.requests.insert(
                    request_id.to_string(),
                    RequestState::Settled {
                        settlement: Settlement::Cancelled,
                        at,
                    },
                );
                true
            }
        }
    }

    pub fn set_available(&self, worker_id: &str, available: bool) {
        let next = if available {
            WorkerState::Available
        } else {
            WorkerState::Offline
        };
        self.state().workers.insert(worker_id.to_string(), next);
    }

    /// Return a busy worker to the pool. Its request stays assigned.
    pub fn release_worker(&self, worker_id: &str) {
        let mut state = self.state();
        self.free_worker(&mut state, worker_id);
    }

    pub fn assignment_for(&self, request_id: &str) -> Option<String> {
        match self.state().requests.get(request_id) {
            Some(RequestState::Assigned { worker_id, .. }) => Some(worker_id.clone()),
            _ => None,
        }
    }

    pub fn current_request(&self, worker_id: &str) -> Option<String> {
        match self.state().workers.get(worker_id) {
            Some(WorkerState::Busy { request_id, .. }) => Some(request_id.clone()),
            _ => None,
        }
    }

    /// Requests and workers currently tracked.
    pub fn tracked(&self) -> (usize, usize) {
        let state = self.state();
        (state.requests.len(), state.workers.len())
    }

    /// Free workers whose claim is older than `claim_ttl`, then forget
    /// requests settled, or assigned with a freed worker, longer than
    /// `retention` ago.
    pub fn purge(&self, claim_ttl: Duration, retention: Duration) -> LedgerPurge {
        let now = self.clock.now();
        let older_than = |since: DateTime<Utc>, limit: Duration| {
            (now - since)
                .to_std()
                .map(|age| age > limit)
                .unwrap_or(false)
        };

        let mut state = self.state();
        let expired: Vec<String> = state
            .workers
            .iter()
            .filter_map(|(worker_id, worker)| match worker {
                WorkerState::Busy { since, .. } if older_than(*since, claim_ttl) => {
                    Some(worker_id.clone())
                }
                _ => None,
            })
            .collect();
        for worker_id in &expired {
            self.free_worker(&mut state, worker_id);
        }

        let before = state.requests.len();
        state.requests.retain(|_, request| match request {
            RequestState::Searching => true,
            RequestState::Assigned { since, .. } => {
                !older_than(*since, claim_ttl.saturating_add(retention))
            }
            RequestState::Settled { at, .. } => !older_than(*at, retention),
        });

        LedgerPurge {
            released_workers: expired.len(),
            evicted_requests: before - state.requests.len(),
        }
    }

    fn free_worker(&self, state: &mut LedgerState, worker_id: &str) {
        match self.mode {
            LedgerMode::Permissive => {
                state.workers.remove(worker_id);
            }
            LedgerMode::Strict => {
                state
                    .workers
                    .insert(worker_id.to_string(), WorkerState::Available);
            }
        }
    }

    fn free_worker_of(&self, state: &mut LedgerState, worker_id: &str, request_id: &str) -> bool {
        let holds = matches!(
            state.workers.get(worker_id),
            Some(WorkerState::Busy { request_id: held, .. }) if held == request_id
        );
        if holds {
            self.free_worker(state, worker_id);
        }
        holds
    }

    fn worker_available(&self, state: &LedgerState, worker_id: &str) -> bool {
        match state.workers.get(worker_id) {
            Some(WorkerState::Available) => true,
            Some(_) => false,
            None => self.mode == LedgerMode::Permissive,
        }
    }

    fn request_searching(&self, state: &LedgerState, request_id: &str) -> Option<bool> {
        match state.requests.get(request_id) {
            Some(RequestState::Searching) => Some(true),
            Some(RequestState::Assigned { .. }) => Some(false),
            Some(RequestState::Settled {
                settlement: Settlement::Completed,
                ..
            }) => Some(false),
            Some(RequestState::Settled {
                settlement: Settlement::Cancelled,
                ..
            }) => None,
            None if self.mode == LedgerMode::Permissive => Some(true),
            None => None,
        }
    }
}

impl AssignmentLedger for InMemoryAssignmentLedger {
    async fn is_available(&self, worker_id: &str) -> Result<bool, String> {
        let state = self.state();
        Ok(self.worker_available(&state, worker_id))
    }

    async fn claim(&self, request_id: &str, worker_id: &str) -> Result<ClaimOutcome, String> {
        let since = self.clock.now();
        let mut state = self.state();
        match self.request_searching(&state, request_id) {
            None => return Ok(ClaimOutcome::UnknownRequest),
            Some(false) => return Ok(ClaimOutcome::RequestAlreadyAssigned),
            Some(true) => {}
        }
        if !self.worker_available(&state, worker_id) {
            return Ok(ClaimOutcome::WorkerUnavailable);
        }

        state.requests.insert(
            request_id.to_string(),
            RequestState::Assigned {
                worker_id: worker_id.to_string(),
                since,
            },
        );
        state.workers.insert(
            worker_id.to_string(),
            WorkerState::Busy {
                request_id: request_id.to_string(),
                since,
            },
        );
        Ok(ClaimOutcome::Assigned)
    }

    async fn release_claim(&self, request_id: &str, worker_id: &str) -> Result<(), String> {
        let mut state = self.state();
        let held = matches!(
            state.requests.get(request_id),
            Some(RequestState::Assigned { worker_id: holder, .. }) if holder == worker_id
        );
        if !held {
            return Ok(());
        }
        state
            .requests
            .insert(request_id.to_string(), RequestState::Searching);
        self.free_worker_of(&mut state, worker_id, request_id);
        Ok(())
    }

    async fn settle(
        &self,
        request_id: &str,
        settlement: Settlement,
    ) -> Result<Option<String>, String> {
        let at = self.clock.now();
        let mut state = self.state();
        let freed = match state.requests.get(request_id).cloned() {
            Some(RequestState::Settled {
                settlement: Settlement::Completed,
                ..
            }) => return Ok(None),
            Some(RequestState::Assigned { worker_id, .. }) => self
                .free_worker_of(&mut state, &worker_id, request_id)
                .then_some(worker_id),
            _ => None,
        };
        state
            .requests
            .insert(request_id.to_string(), RequestState::Settled { settlement, at });
        Ok(freed)
    }
}
