use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Interval between readiness probes. Short relative to any sensible start
/// timeout so `start` returns soon after the server is actually up.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Health checker trait for managed servers
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `Ok(true)` when healthy, `Ok(false)` when not yet healthy.
    ///
    /// An `Err` means the check can never succeed (e.g. the process exited)
    /// and polling stops early.
    async fn check(&self) -> Result<bool>;

    /// Get the timeout for a single check
    fn timeout(&self) -> Duration;
}

/// Poll `checker` every `interval` until it reports healthy or `timeout`
/// elapses.
///
/// The checker always runs at least once, so a zero timeout is a cheap
/// "is it already up" probe. Returns false on timeout or on a fatal check
/// error; never sleeps past the deadline.
pub async fn wait_for<C: HealthChecker + ?Sized>(
    checker: &C,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match checker.check().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::debug!("Readiness polling aborted: {}", e);
                return false;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Poll until `checker` reports unhealthy (e.g. the endpoint stopped
/// accepting connections) or `timeout` elapses. Returns true once it is down.
pub async fn wait_for_closed<C: HealthChecker + ?Sized>(
    checker: &C,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !checker.check().await.unwrap_or(false) {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}
