//! Retry utilities with bounded jitter.
//!
//! Provides a retry policy with exponential backoff plus additive jitter and
//! a helper that drives an async operation until it succeeds, fails
//! permanently, or the attempt budget runs out.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether this error should be retried.
    fn is_retryable(&self) -> bool;
}

/// Retry policy for login attempts and other flaky fleet calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Base delay between retries (exponential backoff).
    pub base_delay: Duration,
    /// Maximum backoff before jitter is added.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added before each retry.
    pub max_jitter: Duration,
    /// Optional wall-clock ceiling across all attempts.
    pub max_total: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_jitter: Duration::from_millis(250),
            max_total: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (1-based) failed.
    ///
    /// `jitter_sample` must be in `[0.0, 1.0)`; it scales `max_jitter`. The
    /// function is pure so the delay curve can be tested deterministically.
    pub fn backoff_delay_with(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let attempt = attempt.max(1);
        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self
            .base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay);
        let sample = jitter_sample.clamp(0.0, 1.0);
        backoff + self.max_jitter.mul_f64(sample)
    }

    /// Delay before retrying after `attempt` failed, with a random jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay_with(attempt, fastrand::f64())
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run an async operation with retries on retryable errors.
///
/// `op` receives the 1-based attempt number.
pub async fn run_with_retry<F, Fut, T, E>(phase: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.attempts();
    let started = Instant::now();
    let mut attempt = 1;

    loop {
        debug!(phase, attempt, max_attempts, "Starting attempt");

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                if let Some(ceiling) = policy.max_total
                    && started.elapsed() + delay >= ceiling
                {
                    warn!(phase, attempt, error = %err, "Retry time budget exhausted");
                    return Err(err);
                }
                warn!(
                    phase,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed (retryable)"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(phase, attempt, error = %err, "Attempt failed (final)");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Retryable,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Retryable => write!(f, "retryable"),
                TestError::Fatal => write!(f, "fatal"),
            }
        }
    }

    impl RetryableError for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Retryable)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_jitter: Duration::from_millis(1),
            max_total: None,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = run_with_retry("test", &fast_policy(3), move |_| {
            let attempts_clone = attempts_clone.clone();
            async move {
                let count = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(TestError::Retryable)
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<u32, TestError> = run_with_retry("test", &fast_policy(3), move |_| {
            let attempts_clone = attempts_clone.clone();
            async move {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<u32, TestError> = run_with_retry("test", &fast_policy(4), move |n| {
            let attempts_clone = attempts_clone.clone();
            async move {
                attempts_clone.store(n, Ordering::SeqCst);
                Err(TestError::Retryable)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Retryable)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_total_ceiling_stops_retrying() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            max_jitter: Duration::ZERO,
            max_total: Some(Duration::from_millis(20)),
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<u32, TestError> = run_with_retry("test", &policy, move |_| {
            let attempts_clone = attempts_clone.clone();
            async move {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Retryable)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delay_exponential_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_jitter: Duration::from_millis(250),
            max_total: None,
        };
        assert_eq!(policy.backoff_delay_with(1, 0.0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay_with(2, 0.0), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay_with(3, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            max_jitter: Duration::ZERO,
            max_total: None,
        };
        assert_eq!(policy.backoff_delay_with(8, 0.5), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 1..5 {
            let floor = policy.backoff_delay_with(attempt, 0.0);
            for _ in 0..100 {
                let delay = policy.backoff_delay(attempt);
                assert!(delay >= floor);
                assert!(delay <= floor + policy.max_jitter);
            }
        }
    }

    #[test]
    fn test_backoff_attempt_zero_treated_as_first() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.backoff_delay_with(0, 0.3),
            policy.backoff_delay_with(1, 0.3)
        );
    }

    #[test]
    fn test_attempts_minimum_one() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.attempts(), 1);
    }
}
