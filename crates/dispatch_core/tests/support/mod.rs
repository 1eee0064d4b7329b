#![allow(dead_code)]

pub mod broker;
pub mod client;

use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(3);

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give in-flight consumers time to act before asserting that nothing more
/// happened.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
