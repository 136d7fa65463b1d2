//! Centralized retry policy for connector network calls.
//!
//! Only [`IngestError::SourceConnectionNetwork`] is retried. Backoff is
//! exponential: `initial, 2×initial, 4×initial, …` capped at
//! `max_backoff`. When attempts run out the last error is escalated to a
//! permanent [`IngestError::SourceConnection`]. Each async attempt runs
//! under a per-call timeout; an elapsed timeout counts as a transient
//! network failure.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run_async<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = with_timeout(self.timeout, op()).await;
            match self.next_step(label, attempt, result) {
                Step::Done(result) => return result,
                Step::Retry(delay) => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }

    /// Blocking counterpart of [`run_async`](Self::run_async).
    ///
    /// Blocking calls enforce their own I/O timeouts; only the retry
    /// schedule is applied here.
    pub fn run_blocking<T, F>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match self.next_step(label, attempt, op()) {
                Step::Done(result) => return result,
                Step::Retry(delay) => std::thread::sleep(delay),
            }
            attempt += 1;
        }
    }

    fn next_step<T>(&self, label: &str, attempt: u32, result: Result<T>) -> Step<T> {
        match result {
            Ok(value) => Step::Done(Ok(value)),
            Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                let delay = self.backoff(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                Step::Retry(delay)
            }
            Err(err) if err.is_retryable() => {
                tracing::error!(operation = label, attempt, error = %err, "retries exhausted");
                Step::Done(Err(err.escalate(attempt)))
            }
            Err(err) => Step::Done(Err(err)),
        }
    }
}

enum Step<T> {
    Done(Result<T>),
    Retry(Duration),
}

/// Await `fut`, mapping an elapsed deadline to a network error.
pub async fn with_timeout<T, Fut>(duration: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::SourceConnectionNetwork(format!(
            "call timed out after {:?}",
            duration
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let value = fast(3)
            .run_async("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IngestError::SourceConnectionNetwork("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_escalate() {
        let calls = AtomicU32::new(0);
        let err = fast(2)
            .run_async("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::SourceConnectionNetwork("reset".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceConnection(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast(5)
            .run_async("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::SourceConnection("denied".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceConnection(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_network_failures() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(10),
            ..fast(2)
        };
        let calls = AtomicU32::new(0);
        let err = policy
            .run_async("slow", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceConnection(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn blocking_mode_matches_async_classification() {
        let mut calls = 0;
        let value = fast(3)
            .run_blocking("fetch", || {
                calls += 1;
                if calls == 1 {
                    Err(IngestError::SourceConnectionNetwork("reset".into()))
                } else {
                    Ok("ok")
                }
            })
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(calls, 2);

        let err = fast(3)
            .run_blocking("fetch", || Err::<(), _>(IngestError::Write("x".into())))
            .unwrap_err();
        assert!(matches!(err, IngestError::Write(_)));
    }
}
