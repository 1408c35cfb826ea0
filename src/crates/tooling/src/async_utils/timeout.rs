use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Failure of a future run under a deadline
#[derive(Debug, Error)]
pub enum TimeoutError<E> {
    /// The future finished with its own error
    #[error("{0}")]
    OperationFailed(E),
    /// The deadline passed first; the future was dropped
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl<E> TimeoutError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutError::Timeout(_))
    }
}

/// Run `operation`, giving up after `duration`
pub async fn with_timeout<F, T, E>(duration: Duration, operation: F) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(duration, operation).await {
        Ok(result) => result.map_err(TimeoutError::OperationFailed),
        Err(_) => Err(TimeoutError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_deadline() {
        let result = with_timeout(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>("done")
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_passes() {
        let err = with_timeout(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, String>("late")
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "timed out after 5s");
    }

    #[tokio::test]
    async fn test_operation_error_is_kept() {
        let err = with_timeout(Duration::from_secs(5), async { Err::<(), _>("bad input") })
            .await
            .unwrap_err();
        assert!(matches!(err, TimeoutError::OperationFailed("bad input")));
    }
}
