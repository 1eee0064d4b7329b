//! Dispatch request matching.
//!
//! A request moves `received -> candidates_fetched -> (assigned | exhausted)`.
//! Candidates come from the proximity index nearest first; the first one the
//! assignment ledger accepts wins. There is no radius expansion and no
//! re-queue when nobody is found. Completed or cancelled bookings return the
//! driver to the pool.

pub mod ledger;
pub mod lifecycle;
pub mod types;
pub mod worker;

pub use ledger::{AssignmentLedger, InMemoryAssignmentLedger, LedgerMode};
pub use lifecycle::{lifecycle_subscription, BookingLifecycle};
pub use types::{ClaimOutcome, LedgerPurge, MatchOutcome, MatchingSettings, Settlement};
pub use worker::{matching_subscription, matching_supervisor, MatchingWorker};
