// Retry logic with exponential backoff

use crate::errors::CoordError;
use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }
}

/// Everything except a request the relay refused outright.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    !matches!(err.downcast_ref::<CoordError>(), Some(CoordError::RelayRejected { .. }))
}

/// Execute a function with exponential backoff retry logic
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 >= attempts || !is_retryable(&e) => return Err(e),
            Err(e) => {
                let delay = policy.base_delay * 2u32.pow(attempt);
                tracing::warn!(
                    "Relay request failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    attempts,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("flaky")
            }
            Ok(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(RetryPolicy::default(), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("failure {}", n)
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_request_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoordError::RelayRejected {
                status: 401,
                body: "bad token".to_string(),
            }
            .into())
        })
        .await;
        assert!(!is_retryable(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_policy_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(RetryPolicy::none(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("down")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
