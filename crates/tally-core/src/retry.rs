// Retry policy for collaborator calls
//
// Exponential backoff with jitter, bounded attempts. Only transient errors
// are retried; exhaustion is surfaced as DeliveryFailure rather than
// silently dropped.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TallyError};

/// Configuration for retrying transient collaborator failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_interval: Duration,

    /// Cap on the delay between retries
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 for exponential doubling)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +/-10% randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults: 5 attempts, 1s initial,
    /// 30s cap, 2x coefficient, 10% jitter.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before the given 1-based attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Run `op` under the policy, retrying only transient errors.
///
/// Non-transient errors propagate immediately. When attempts are exhausted the
/// last transient error is wrapped in `DeliveryFailure` so callers can
/// surface it instead of dropping the event.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_message = String::new();

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(
                    operation = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Transient failure, will retry"
                );
                last_message = e.to_string();
            }
            Err(e) => return Err(e),
        }
    }

    Err(TallyError::DeliveryFailure {
        attempts: policy.max_attempts,
        message: format!("{op_name}: {last_message}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(3)
            .with_initial_interval(Duration::from_millis(1))
            .with_jitter(0.0);
        let calls = AtomicU32::new(0);

        let result = retry_transient(&policy, "test_op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                Err(TallyError::transient_fetch("flaky"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_errors_propagate_immediately() {
        let policy = RetryPolicy::exponential().with_max_attempts(5);
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_transient(&policy, "test_op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TallyError::not_found("gone"))
        })
        .await;

        assert!(matches!(result, Err(TallyError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_becomes_delivery_failure() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(2)
            .with_initial_interval(Duration::from_millis(1))
            .with_jitter(0.0);

        let result: Result<()> = retry_transient(&policy, "test_op", || async {
            Err(TallyError::transient_write("still down"))
        })
        .await;

        match result {
            Err(TallyError::DeliveryFailure { attempts, message }) => {
                assert_eq!(attempts, 2);
                assert!(message.contains("still down"));
            }
            other => panic!("expected DeliveryFailure, got {other:?}"),
        }
    }
}
