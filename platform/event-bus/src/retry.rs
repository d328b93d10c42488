//! Exponential backoff for transient bus operations.
//!
//! Used by publishers to ride out short transport hiccups before giving up
//! and surfacing a `BusError` to the caller. Consumer-side redelivery has its
//! own backoff inside the dispatcher and is configured via `BusConfig`.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Doubling backoff sequence with a cap. Never terminates on its own; the
/// retry policy bounds the number of draws.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self { next: initial, cap }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = std::cmp::min(self.next * 2, self.cap);
        Some(current)
    }
}

/// Retry policy for transient operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Run `operation` until it succeeds or the policy's attempt budget runs out.
///
/// Returns the final error when all attempts fail. `context` names the
/// operation in log output.
pub async fn with_retries<F, Fut, T, E>(
    policy: &RetryPolicy,
    context: &str,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);

    for attempt in 1..=policy.max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(context, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt == policy.max_attempts => {
                warn!(context, attempts = attempt, error = %e, "Operation failed after max retries");
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next().unwrap_or(policy.max_backoff);
                warn!(
                    context,
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );
                sleep(delay).await;
            }
        }
    }

    unreachable!("retry loop always returns within max_attempts")
}
