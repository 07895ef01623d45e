//! Retry policy for steps.

use std::time::Duration;

use time::OffsetDateTime;

/// Retry budget and exponential backoff for a step.
///
/// A step that fails with a retryable error is attempted again after a
/// backoff delay. Once `max_retries` attempts have failed the step is
/// exhausted and the workflow fails until it is recovered.
///
/// # Backoff Calculation
///
/// The delay after failed attempt N (1-based) is
/// `min(base_delay * 2^(N-1), max_delay)`.
///
/// With defaults (base=100ms, max=30s):
/// - Attempt 1 fails: retry after 100ms
/// - Attempt 2 fails: retry after 200ms
/// - Attempt 3 fails: exhausted
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use actorflow::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_retries, 3);
///
/// let patient = RetryPolicy {
///     max_retries: 10,
///     base_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(60),
/// };
/// assert_eq!(patient.backoff_duration(2), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Default: 3.
    pub max_retries: u32,

    /// Delay after the first failure; doubles with each further failure.
    /// Default: 100 milliseconds.
    pub base_delay: Duration,

    /// Upper bound on the delay. Default: 30 seconds.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` failures.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// When the next attempt is due after `attempt` failures.
    pub fn next_attempt_at(&self, attempt: u32) -> OffsetDateTime {
        OffsetDateTime::now_utc() + self.backoff_duration(attempt)
    }

    /// Returns `true` if `attempt` failures leave room for another attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
