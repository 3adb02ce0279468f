//! Retry policy for window scans
//!
//! Retries transient RPC failures with exponential backoff. Any other error
//! fails immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use super::ScanError;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just try once)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Creates a policy with no retries (fail immediately).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Runs `operation`, retrying [`ScanError::is_transient`] failures up to
    /// `max_retries` times. Returns the last error.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, ScanError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScanError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            target: "evidence_resolver::scan::retry",
                            retries = attempt,
                            "Scan recovered"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_retries {
                tracing::error!(
                    target: "evidence_resolver::scan::retry",
                    attempts = attempt + 1,
                    error = %err,
                    "Giving up on scan"
                );
                return Err(err);
            }

            attempt += 1;
            let delay = self.backoff(attempt);
            tracing::warn!(
                target: "evidence_resolver::scan::retry",
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient scan failure, retrying"
            );
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn rate_limited() -> ScanError {
        ScanError::Transient {
            network: Network::Gnosis,
            from_block: 0,
            to_block: 99,
            message: "rate limited".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20), 2.0);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let c = counter_clone.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(rate_limited());
                    }
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        // 2 failures + 1 success
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(20), 2.0);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), ScanError> = policy
            .execute(|| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(rate_limited())
                }
            })
            .await;

        assert!(matches!(result, Err(ScanError::Transient { .. })));
        // Initial + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(5), Duration::from_millis(20), 2.0);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), ScanError> = policy
            .execute(|| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ScanError::NoProvider(Network::Mainnet))
                }
            })
            .await;

        assert!(matches!(result, Err(ScanError::NoProvider(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), ScanError> = policy
            .execute(|| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(rate_limited())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
