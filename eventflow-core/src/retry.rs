use std::future::Future;

use backoff::retry::Retry;
use eventflow_shared::error::{Error as SharedError, Result as SharedResult};
use tracing::warn;

use crate::config::RetryConfig;

/// Runs a store or source call, retrying transient failures with exponential backoff. Permanent
/// errors and the last transient error are returned as-is.
pub(crate) async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    op: F,
) -> SharedResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SharedResult<T>>,
{
    Retry::new(config.backoff(), op, |e: &SharedError| {
        if e.is_transient() {
            warn!(operation, error = %e, "Transient failure, retrying");
            true
        } else {
            false
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&fast(), "get", move || {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(SharedError::Store("busy".to_string()))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: SharedResult<()> = with_retry(&fast(), "list", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SharedError::StreamNotFound("orders".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(SharedError::StreamNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: SharedResult<()> = with_retry(&fast(), "cas", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SharedError::Store("down".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
