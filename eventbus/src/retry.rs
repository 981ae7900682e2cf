use std::future::Future;
use std::time::Duration;

use crate::{Error, Result};

/// Bounded retry for store writes.
///
/// Attempt `n` (1-based) that fails transiently sleeps `n^4 * base` before the
/// next one: 10ms, 160ms, 810ms with the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_pow(4))
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// Non-transient errors are returned as-is. Exhausting the budget returns
    /// [`Error::RetryExhausted`] wrapping the last failure.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::error!(operation, attempts = attempt, "Retries exhausted: {}", e);
                    return Err(Error::RetryExhausted {
                        operation,
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient store failure: {}, retrying",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_micros(1),
        }
    }

    #[test]
    fn test_delay_grows_with_fourth_power() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(160));
        assert_eq!(policy.delay_after(3), Duration::from_millis(810));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("write", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::connection("flaky"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::connection("down"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, Error::RetryExhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("write", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::config("bad"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Config(_)));
    }
}
