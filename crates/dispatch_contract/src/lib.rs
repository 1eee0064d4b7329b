//! Wire contract shared by the dispatch services.
//!
//! This crate owns message payloads, the closed envelope set exchanged over
//! the broker as bare JSON bodies, and the exchange/queue naming scheme. It
//! intentionally excludes broker, index and session concerns, which live in
//! `dispatch_core`.

pub mod contract;
pub mod topology;
