//! Retry with fixed quadratic backoff for LLM calls
//!
//! LLM providers fail transiently (rate limits, resets, 5xx). Calls wrapped here are
//! attempted [`MAX_ATTEMPTS`] times; after failed attempt `n` (0-based) the wrapper
//! sleeps `(n + 1)^2` seconds, giving the fixed schedule 1s, 4s, 9s, before giving up.
//!
//! ```text
//! attempt 0 ──fail──▶ sleep 1s ──▶ attempt 1 ──fail──▶ sleep 4s
//!           ──▶ attempt 2 ──fail──▶ sleep 9s ──▶ RetryError::Exhausted
//! ```
//!
//! Both an async ([`retry_async`]) and a blocking ([`retry_sync`]) variant exist.
//! The `_if` variants stop immediately on errors the predicate rejects;
//! [`handle_llm_errors`] uses that to retry only [`ToolError::Transient`] failures.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::tool::{ToolArgs, ToolError, ToolFn, ToolFuture};

/// Attempts made before giving up
pub const MAX_ATTEMPTS: u32 = 3;

/// Sleep after failed attempt `attempt` (0-based)
pub fn backoff_delay(attempt: u32) -> Duration {
    let step = u64::from(attempt) + 1;
    Duration::from_secs(step * step)
}

/// Tracks attempts and the last error for logging
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempts += 1;
        self.last_error = error;
    }
}

/// Why a retried operation failed
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed
    Exhausted { attempts: u32, last_error: E },
    /// The error was not eligible for retry
    Aborted(E),
}

impl<E> RetryError<E> {
    /// The underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Aborted(e) => e,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => write!(f, "Retry exhausted after {} attempts: {}", attempts, last_error),
            RetryError::Aborted(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Retry an async operation on any error
pub async fn retry_async<T, E, F, Fut>(operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_async_if(operation, |_| true).await
}

/// Retry an async operation while `should_retry` accepts the error
pub async fn retry_async_if<T, E, F, Fut, P>(
    mut operation: F,
    should_retry: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut state = RetryState::new();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !should_retry(&error) => return Err(RetryError::Aborted(error)),
            Err(error) => {
                let delay = backoff_delay(state.attempts);
                state.record_attempt(Some(error.to_string()));
                tracing::warn!(
                    attempt = state.attempts,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "call failed, backing off"
                );
                tokio::time::sleep(delay).await;
                if state.attempts >= MAX_ATTEMPTS {
                    return Err(RetryError::Exhausted {
                        attempts: state.attempts,
                        last_error: error,
                    });
                }
            }
        }
    }
}

/// Blocking variant of [`retry_async`]
pub fn retry_sync<T, E, F>(operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: fmt::Display,
{
    retry_sync_with(operation, |_| true, std::thread::sleep)
}

/// Blocking variant of [`retry_async_if`]
pub fn retry_sync_if<T, E, F, P>(operation: F, should_retry: P) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    retry_sync_with(operation, should_retry, std::thread::sleep)
}

fn retry_sync_with<T, E, F, P, S>(
    mut operation: F,
    should_retry: P,
    mut sleep: S,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    S: FnMut(Duration),
    E: fmt::Display,
{
    let mut state = RetryState::new();
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if !should_retry(&error) => return Err(RetryError::Aborted(error)),
            Err(error) => {
                let delay = backoff_delay(state.attempts);
                state.record_attempt(Some(error.to_string()));
                tracing::warn!(
                    attempt = state.attempts,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "call failed, backing off"
                );
                sleep(delay);
                if state.attempts >= MAX_ATTEMPTS {
                    return Err(RetryError::Exhausted {
                        attempts: state.attempts,
                        last_error: error,
                    });
                }
            }
        }
    }
}

/// Wrap an LLM tool so transient failures are retried
///
/// Only transient failures are retried on the fixed schedule, surfacing as
/// [`ToolError::RetryExhausted`] once the attempts run out. Anything else is
/// returned at once.
pub fn handle_llm_errors(tool: ToolFn) -> ToolFn {
    Arc::new(move |args: ToolArgs| -> ToolFuture {
        let tool = tool.clone();
        Box::pin(async move {
            retry_async_if(|| tool(args.clone()), ToolError::is_retryable)
                .await
                .map_err(|err| match err {
                    RetryError::Exhausted {
                        attempts,
                        last_error,
                    } => ToolError::RetryExhausted {
                        attempts,
                        last_error: last_error.to_string(),
                    },
                    RetryError::Aborted(e) => e,
                })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{tool_fn, NodeOutput};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule() {
        let delays: Vec<u64> = (0..MAX_ATTEMPTS).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 4, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_retry_attempts_three_times_then_gives_up() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result: Result<(), RetryError<String>> = retry_async(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom".to_string()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "boom");
            }
            RetryError::Aborted(_) => panic!("expected exhaustion"),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(14) && elapsed < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_retry_recovers() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = retry_async(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("flaky")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_sync_retry_sleeps_on_schedule() {
        let mut calls = 0;
        let mut slept = Vec::new();
        let result: Result<(), RetryError<&str>> = retry_sync_with(
            || {
                calls += 1;
                Err("down")
            },
            |_| true,
            |d| slept.push(d.as_secs()),
        );
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls, 3);
        assert_eq!(slept, vec![1, 4, 9]);
    }

    #[test]
    fn test_sync_retry_succeeds_first_time() {
        let result: Result<i32, RetryError<String>> = retry_sync(|| Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_wrapper_does_not_retry_invalid_arguments() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let tool = tool_fn(move |_args| {
            let counter = counter.clone();
            async move {
                *counter.lock() += 1;
                Err::<NodeOutput, _>(ToolError::invalid_argument("prompt", "missing"))
            }
        });

        let err = handle_llm_errors(tool)(ToolArgs::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_wrapper_exhausts_on_transient_errors() {
        let tool = tool_fn(|_args| async move {
            Err::<NodeOutput, _>(ToolError::transient("429 Too Many Requests"))
        });

        let err = handle_llm_errors(tool)(ToolArgs::new()).await.unwrap_err();
        match err {
            ToolError::RetryExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("429"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_wrapper_passes_success_through() {
        let tool = tool_fn(|args: ToolArgs| async move {
            Ok(NodeOutput::from(args.get("x").cloned().unwrap_or(json!(null))))
        });
        let output = handle_llm_errors(tool)(ToolArgs::new().with("x", json!(5)))
            .await
            .unwrap();
        match output {
            NodeOutput::Value(v) => assert_eq!(v, json!(5)),
            NodeOutput::Stream(_) => panic!("expected a value"),
        }
    }
}
