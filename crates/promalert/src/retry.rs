//! Bounded retries with exponential backoff for external calls.

use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Transient;

/// Retry settings as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first call included
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// How external calls are bounded and retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Time limit of each attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default(), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: &RetryConfig, call_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            call_timeout,
        }
    }

    /// A single attempt per call.
    #[must_use]
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            call_timeout,
        }
    }

    /// Calculate the delay after the given failed attempt (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Check if another attempt is allowed after `attempts` were made.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Run `call` under the per-attempt timeout, retrying transient failures.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        self.run_if(operation, E::is_transient, call).await
    }

    /// Like [`run`](Self::run), but only failures accepted by `retryable` are
    /// retried.
    pub async fn run_if<T, E, P, F, Fut>(
        &self,
        operation: &str,
        retryable: P,
        mut call: F,
    ) -> Result<T, E>
    where
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = tokio::time::timeout(self.call_timeout, call())
                .await
                .unwrap_or_else(|_| Err(E::timed_out(self.call_timeout)));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && self.should_retry(attempts) => {
                    let delay = self.delay_for_attempt(attempts - 1);
                    warn!(
                        operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(&RetryConfig::default(), Duration::from_secs(1))
    }

    #[test]
    fn test_delay_progression() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, QueryError> = policy()
            .run("query", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(QueryError::Status {
                        status: 503,
                        body: String::new(),
                    })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), QueryError> = policy()
            .run("query", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueryError::Timeout(Duration::from_secs(1)))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), QueryError> = policy()
            .run("query", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueryError::Decode("bad".into()))
            })
            .await;

        assert!(matches!(result, Err(QueryError::Decode(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_predicate_limits_retries() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), QueryError> = policy()
            .run_if(
                "query",
                |e: &QueryError| !matches!(e, QueryError::Timeout(_)),
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(QueryError::Timeout(Duration::from_secs(1)))
                },
            )
            .await;

        assert!(matches!(result, Err(QueryError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let result: Result<(), QueryError> = RetryPolicy::no_retry(Duration::from_millis(50))
            .run("query", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(QueryError::Timeout(d)) if d == Duration::from_millis(50)));
    }
}
