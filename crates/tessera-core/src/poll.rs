//! Bounded polling.
//!
//! Every cross-node wait (leader election, migration commit, N nodes unsealed)
//! goes through [`poll_until`] so timeout semantics are identical everywhere:
//! the check runs at least once, and exceeding the deadline is an error.

use crate::errors::{SealError, SealResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Poll interval and overall deadline for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay between checks
    pub interval: Duration,
    /// Give up once this much time has passed
    pub timeout: Duration,
}

impl PollPolicy {
    /// Build a policy from an interval and a deadline
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Run `check` every `policy.interval` until it yields a value.
///
/// `Ok(None)` means "not yet"; an `Err` from the check aborts the wait
/// immediately. Callers that want to tolerate transient errors map them to
/// `Ok(None)` themselves.
pub async fn poll_until<T, F, Fut>(what: &str, policy: PollPolicy, mut check: F) -> SealResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SealResult<Option<T>>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(SealError::timeout(
                format!("{what} did not complete after {attempts} attempts"),
                elapsed.as_millis() as u64,
            ));
        }

        debug!(what, attempts, "condition not met yet, polling again");
        sleep(policy.interval).await;
    }
}
