//! Deadline-bounded external calls with exponential backoff
//!
//! Every call is wrapped in `tokio::time::timeout`; a timeout becomes a
//! retryable `Timeout` error. Only errors classified retryable by
//! `TopologyError::is_retryable` are retried, and never past
//! `max_attempts`.

use crate::config::RetryPolicy;
use crate::error::{Result, TopologyError};
use crate::observability::TopologyMetrics;
use std::future::Future;

/// Run one external call under the policy's deadline
pub async fn with_deadline<T, F>(policy: &RetryPolicy, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let deadline = policy.call_timeout();
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(TopologyError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: deadline.as_millis() as u64,
        }),
    }
}

/// Run an external call, retrying transient failures with backoff
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    metrics: &TopologyMetrics,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        metrics.record_provision_attempt(attempt > 1);
        match with_deadline(policy, operation, call()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying external call"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        operation = operation,
                        attempts = attempt,
                        error = %e,
                        "External call failed after retries"
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
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            call_timeout_secs: 5,
            placement_wait_secs: 60,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let metrics = TopologyMetrics::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&policy(), "place", &metrics, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TopologyError::transient("throttled"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let snap = metrics.snapshot();
        assert_eq!(snap.provision_attempts, 2);
        assert_eq!(snap.provision_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_max_attempts() {
        let metrics = TopologyMetrics::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&policy(), "place", &metrics, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TopologyError::transient("throttled"))
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let metrics = TopologyMetrics::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&policy(), "place", &metrics, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TopologyError::permanent("image missing"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_as_timeout() {
        let result: Result<()> = with_deadline(&policy(), "describe", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result.unwrap_err(),
            TopologyError::Timeout { elapsed_ms: 5000, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let metrics = TopologyMetrics::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&policy(), "place", &metrics, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
