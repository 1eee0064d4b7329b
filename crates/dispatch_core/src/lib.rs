//! Dispatch engine: proximity index, message channel, matching, live
//! location gateway and location integrity checks.
//!
//! Components share state only through explicit `Arc` handles; nothing in
//! this crate is a process-wide singleton apart from the tracing subscriber.

pub mod channel;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod geo;
pub mod integrity;
pub mod matching;
pub mod spatial;
pub mod telemetry;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;
