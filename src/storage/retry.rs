//! Bounded retry with exponential backoff.
//!
//! Backoff waits on a tokio timer, so a pending retry holds no thread while
//! it sleeps.

use crate::core::{Result, RetryPolicy};
use log::{info, warn};
use std::future::Future;
use tokio::time::sleep;

/// Successful result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// `policy.max_attempts` is exhausted. The last error is returned on failure.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<Retried<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(
                        "{}: succeeded on attempt {}/{}",
                        operation_name, attempt, max_attempts
                    );
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{}: attempt {}/{} failed: {}. Retrying in {}ms",
                    operation_name,
                    attempt,
                    max_attempts,
                    err,
                    delay.as_millis()
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PersistError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let calls = &AtomicU32::new(0);
        let result = retry_with_backoff(&quick_policy(3), "flaky", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(PersistError::IoError("disk busy".to_string()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<Retried<()>> =
            retry_with_backoff(&quick_policy(2), "broken", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PersistError::IoError("disk gone".to_string()))
            })
            .await;

        assert!(matches!(result, Err(PersistError::IoError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_corruption() {
        let calls = &AtomicU32::new(0);
        let result: Result<Retried<()>> =
            retry_with_backoff(&quick_policy(5), "parse", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PersistError::Corrupted {
                    path: "x.json".into(),
                    reason: "bad json".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(PersistError::Corrupted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
