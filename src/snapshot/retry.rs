//! Bounded retry with exponential backoff

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use super::error::SnapshotError;

/// Kind of resource an operation touches; selects the default policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Database,
    Network,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Database => f.write_str("database"),
            ResourceClass::Network => f.write_str("network"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn for_class(class: ResourceClass) -> Self {
        match class {
            ResourceClass::Database => Self {
                max_attempts: 3,
                base_delay: Duration::from_millis(25),
                max_delay: Duration::from_millis(500),
            },
            ResourceClass::Network => Self {
                max_attempts: 5,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
            },
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_class(ResourceClass::Database)
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    class: ResourceClass,
    mut f: F,
) -> Result<T, SnapshotError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SnapshotError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation,
                    resource = %class,
                    attempt = attempt,
                    error = %e,
                    "Operation failed after max attempts"
                );
                return Err(SnapshotError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = %operation,
                    resource = %class,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying..."
                );
                tokio::time::sleep(delay).await;
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
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "touch", ResourceClass::Database, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SnapshotError::Lock("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(tokio_test::assert_ok!(result), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reported() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(), "record", ResourceClass::Database, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SnapshotError::Lock("busy".into())) }
        })
        .await;
        match result {
            Err(SnapshotError::RetriesExhausted { attempts, operation, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(operation, "record");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(), "get", ResourceClass::Database, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SnapshotError::NotFound("k".into())) }
        })
        .await;
        assert!(matches!(result, Err(SnapshotError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
