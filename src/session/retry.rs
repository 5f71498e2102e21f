//! Bounded retry with exponential backoff for room connection

use std::future::Future;
use std::time::{Duration, SystemTime};

use crate::Result;

/// Retry policy for connecting to a room
///
/// The default makes a single attempt; retries must be configured
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

/// Compute the delay before the next retry attempt
///
/// Follows `min(base_delay * 2^attempt + jitter, max_delay)` where jitter is
/// 0-25% of the base, derived from the system clock.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails permanently or retries run out
///
/// Only errors for which [`crate::Error::is_retryable`] holds are retried.
///
/// # Errors
///
/// Returns the last error from `op`
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = delay_for_attempt(policy, attempt);
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_growth() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };

        assert!(delay_for_attempt(&policy, 0) >= Duration::from_millis(100));
        assert!(delay_for_attempt(&policy, 1) >= Duration::from_millis(200));
        assert!(delay_for_attempt(&policy, 2) >= Duration::from_millis(400));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            ..RetryPolicy::default()
        };
        assert!(delay_for_attempt(&policy, 3) <= policy.max_delay);
    }

    #[test]
    fn default_policy_does_not_retry() {
        assert_eq!(RetryPolicy::default().max_retries, 0);
        assert_eq!(RetryPolicy::none(), RetryPolicy::default());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);

        let value = with_retry(&policy, "connect", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Connection("refused".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy, "connect", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Connection("refused".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy {
            max_retries: 5,
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy, "connect", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Config("bad room token".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
