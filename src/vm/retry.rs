//! Cancellable fixed-interval polling with an overall time budget.
//!
//! [`poll_until`] runs an attempt, sleeps `interval`, and repeats until the
//! attempt yields a value, the attempt budget is spent, the overall timeout
//! elapses, or the cancellation token fires.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Interval and budget for [`poll_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Attempts that fit in the budget: `ceil(timeout / interval)`, at least 1.
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        let attempts = self.timeout.as_millis().div_ceil(interval);
        attempts.clamp(1, u32::MAX as u128) as u32
    }
}

/// Why polling stopped without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    TimedOut { attempts: u32, elapsed: Duration },
    Cancelled,
}

/// Poll `attempt` until it returns `Some`.
///
/// `attempt` receives the 1-based attempt number. Cancellation is observed
/// both while an attempt is in flight and while sleeping.
pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let max_attempts = policy.max_attempts();
    let mut made = 0;

    while made < max_attempts {
        made += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => break,
            outcome = attempt(made) => outcome,
        };
        if let Some(value) = outcome {
            return Ok(value);
        }
        trace!(attempt = made, max_attempts, "poll attempt not satisfied");

        if made == max_attempts {
            break;
        }
        let next = Instant::now() + policy.interval;
        if next >= deadline {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(next) => {}
        }
    }

    Err(PollError::TimedOut {
        attempts: made,
        elapsed: started.elapsed(),
    })
}
