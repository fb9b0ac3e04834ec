//! Bounded retries with exponential backoff
//!
//! Every attempt runs under a hard timeout. Validation errors are not
//! retried since repeating them cannot change the outcome.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::AcmeSettings;
use crate::error::{ProvisionError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Delay after the first failure; doubles after each further failure
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, attempt_timeout: Duration, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            initial_backoff,
        }
    }

    /// Delay before attempt `failed_attempt + 1`
    pub fn backoff_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

impl From<&AcmeSettings> for RetryPolicy {
    fn from(settings: &AcmeSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_secs(settings.attempt_timeout_secs),
            Duration::from_secs(settings.initial_backoff_secs),
        )
    }
}

/// Run `attempt_fn` until it succeeds or the policy is exhausted.
/// The closure receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        match timeout(policy.attempt_timeout, attempt_fn(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e @ ProvisionError::Validation { .. })) => return Err(e),
            Ok(Err(e)) => {
                warn!(operation, attempt, max = policy.max_attempts, error = %e, "Attempt failed");
                last_error = e.to_string();
            }
            Err(_) => {
                let e = ProvisionError::Timeout {
                    operation: operation.to_string(),
                    secs: policy.attempt_timeout.as_secs(),
                };
                warn!(operation, attempt, max = policy.max_attempts, error = %e, "Attempt timed out");
                last_error = e.to_string();
            }
        }

        if attempt < policy.max_attempts {
            sleep(policy.backoff_after(attempt)).await;
        }
    }

    Err(ProvisionError::RetriesExhausted {
        operation: operation.to_string(),
        attempts: policy.max_attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(200), Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_secs(120), Duration::from_secs(5));
        assert_eq!(policy.backoff_after(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(20));
    }

    #[test]
    fn test_policy_from_acme_settings() {
        let policy = RetryPolicy::from(&AcmeSettings::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&fast_policy(3), "flaky", move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(ProvisionError::tool("acme", "order pending"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let result: Result<()> = retry_with_backoff(&fast_policy(3), "always fails", |_| async {
            Err(ProvisionError::tool("acme", "challenge invalid"))
        })
        .await;

        match result {
            Err(ProvisionError::RetriesExhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("challenge invalid"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let policy = RetryPolicy::new(2, Duration::from_millis(20), Duration::from_millis(1));
        let result: Result<()> = retry_with_backoff(&policy, "slow", |_| async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(ProvisionError::RetriesExhausted { last_error, .. }) => {
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(3), "invalid", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProvisionError::validation("bad.test", "rejected identifier"))
            }
        })
        .await;

        assert!(matches!(result, Err(ProvisionError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
