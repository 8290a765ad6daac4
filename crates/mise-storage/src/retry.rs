//! Bounded exponential backoff for transient storage failures.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::traits::{StorageError, StorageResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No retries; used by tests and for non-replayable operations.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped, without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    key: &str,
    mut op: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.jittered(attempt - 1);
                tracing::warn!(
                    error = %e,
                    operation,
                    key = %key,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient storage error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if let StorageError::QuotaExceeded(_) = e {
                    tracing::error!(
                        error = %e,
                        operation,
                        key = %key,
                        alert = true,
                        "Storage quota exceeded"
                    );
                } else if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        operation,
                        key = %key,
                        attempts = attempt,
                        "Storage operation failed after retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_exponential_then_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn transient_errors_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast_policy(3), "get", "k", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Transient("503".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let calls = AtomicU32::new(0);
        let result: StorageResult<()> = retry_transient(&fast_policy(3), "put", "k", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Transient("reset".to_string()))
        })
        .await;
        assert!(matches!(result, Err(StorageError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_and_quota_errors_not_retried() {
        for err in [
            StorageError::Permanent("403".to_string()),
            StorageError::QuotaExceeded("full".to_string()),
        ] {
            let calls = AtomicU32::new(0);
            let err_text = err.to_string();
            let mut slot = Some(err);
            let result: StorageResult<()> = retry_transient(&fast_policy(5), "put", "k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                let e = slot.take();
                async move { Err(e.unwrap_or(StorageError::Transient("unexpected".into()))) }
            })
            .await;
            assert_eq!(result.unwrap_err().to_string(), err_text);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
