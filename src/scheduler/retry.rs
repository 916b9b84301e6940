//! Failure classification and retry backoff.
//!
//! Failures come in two kinds: transient ones that consume retry budget and
//! are requeued with exponential backoff, and permanent ones that dead-letter
//! the task immediately regardless of how many attempts remain.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default backoff base.
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Default backoff cap.
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(15 * 60);

/// Default jitter fraction applied to the backoff.
const DEFAULT_JITTER: f64 = 0.2;

/// Classification of a processing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient: timeout, lock contention, temporary unavailability.
    /// Retried with backoff until the attempt budget runs out.
    Retryable,
    /// Permanent: invalid parameters, not-found, auth failure. Dead-letters
    /// immediately without consuming the remaining budget.
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Retryable => write!(f, "retryable"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Exponential backoff policy with a cap and proportional jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the computed delay.
    pub cap: Duration,
    /// Jitter fraction in `[0, 1]`; the final delay is scaled by a random
    /// factor in `[1 - jitter, 1 + jitter]` to avoid thundering herds.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given base delay and defaults otherwise.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }

    /// Sets the delay cap.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Sets the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// The capped exponential delay for a retry after `attempts` failures,
    /// before jitter: `min(base * 2^(attempts - 1), cap)`.
    ///
    /// `attempts` counts the failure that just happened, so the first retry
    /// (attempts = 1) waits the base delay.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }

    /// The delay with jitter applied.
    pub fn delay_with_jitter(&self, attempts: u32) -> Duration {
        use rand::RngExt;

        let delay = self.delay(attempts);
        if self.jitter <= 0.0 {
            return delay;
        }

        let scale = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((delay.as_millis() as f64 * scale) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(Duration::from_secs(10)).with_jitter(0.0);

        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(80));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(10))
            .with_cap(Duration::from_secs(60))
            .with_jitter(0.0);

        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(60));
        assert_eq!(policy.delay(30), Duration::from_secs(60));
        // Large attempt counts must not overflow the shift.
        assert_eq!(policy.delay(4000), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_attempts_waits_base() {
        let policy = RetryPolicy::new(Duration::from_secs(5)).with_jitter(0.0);
        assert_eq!(policy.delay(0), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(Duration::from_secs(10)).with_jitter(0.5);

        for _ in 0..100 {
            let delay = policy.delay_with_jitter(1);
            assert!(delay >= Duration::from_secs(5), "delay {delay:?} below bound");
            assert!(delay <= Duration::from_secs(15), "delay {delay:?} above bound");
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = RetryPolicy::new(Duration::from_secs(10)).with_jitter(0.0);
        assert_eq!(policy.delay_with_jitter(2), Duration::from_secs(20));
    }

    #[test]
    fn test_jitter_clamped() {
        let policy = RetryPolicy::default().with_jitter(3.0);
        assert!((policy.jitter - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Retryable.to_string(), "retryable");
        assert_eq!(FailureKind::Permanent.to_string(), "permanent");
    }
}
