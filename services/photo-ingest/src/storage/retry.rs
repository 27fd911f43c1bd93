//! Bounded retry with exponential backoff and jitter for storage calls.

use super::{StorageError, StorageResult};
use crate::config::RetryConfig;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Multiplier applied to the delay after every failed attempt.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Jitter as a fraction of the current delay. Kept below 1/3 so that with a
/// multiplier of 2 consecutive delays never overlap.
const JITTER_FACTOR: f64 = 0.25;

/// Retry policy shared by every storage operation of a job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_multiplier(BACKOFF_MULTIPLIER)
            .with_randomization_factor(JITTER_FACTOR)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1u32;

        loop {
            let err: StorageError = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Storage operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.max_attempts {
                if attempt > 1 {
                    warn!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "Storage operation failed, giving up"
                    );
                }
                return Err(err);
            }

            let delay = backoff.next_backoff().unwrap_or(self.max_delay);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Storage operation failed, retrying"
            );
            metrics::counter!("photo_ingest.storage.retries").increment(1);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            Duration::from_millis(100),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_after_increasing_delays() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut seen = Vec::new();

        let result: StorageResult<()> = policy(4)
            .run("get", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                seen.push(Instant::now());
                async move { Err(StorageError::S3(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(StorageError::S3(msg)) => assert_eq!(msg, "attempt 4"),
            other => panic!("unexpected result: {other:?}"),
        }

        let delays: Vec<Duration> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(delays.len(), 3);
        assert!(delays[0] >= Duration::from_millis(75));
        assert!(delays[0] <= Duration::from_millis(126));
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0], "delays not increasing: {delays:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy(3)
            .run("put", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(StorageError::S3("slow down".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: StorageResult<()> = policy(5)
            .run("get", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StorageError::NotFound {
                        bucket: "ingress".to_string(),
                        key: "missing.jpg".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_clamped_to_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));

        let result: StorageResult<()> = policy
            .run("put", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StorageError::S3("slow down".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
