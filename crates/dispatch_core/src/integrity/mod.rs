//! Location plausibility checks over the fanned-out sample stream.
//!
//! Consecutive samples per worker are compared; an implied speed above the
//! ceiling is a jump. Each jump is recorded, costs the worker trust, and is
//! announced on the fraud exchange.

pub mod detector;
pub mod ledger;
pub mod monitor;

pub use detector::{jump_confidence, JumpAssessment, JumpDetector};
pub use ledger::{AnomalyLog, AnomalyRecord, InMemoryAnomalyLog, InMemoryTrustLedger, TrustLedger};
pub use monitor::{integrity_subscription, integrity_supervisor, IntegrityMonitor, IntegritySettings};
