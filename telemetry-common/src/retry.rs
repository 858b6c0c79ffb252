//! # Retry
//!
//! Bounded exponential backoff used at every point of transient failure:
//! schema registry lookups, time-series writes and dead-letter persistence.
use std::future::Future;
use std::time;

use tracing::warn;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval before the second attempt.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    pub maximum_interval: Option<time::Duration>,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

/// Outcome of a retried operation that never succeeded.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Interval to wait after the given (1-based) failed attempt.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1)));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Runs `operation` until it succeeds, fails with an error `is_retryable`
    /// rejects, or `max_attempts` is reached.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation_name: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut operation: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if is_retryable(&error) && self.can_retry(attempt) => {
                    let interval = self.retry_interval(attempt);
                    warn!(
                        "{} failed on attempt {}/{}, retrying in {:?}: {}",
                        operation_name, attempt, self.max_attempts, interval, error
                    );
                    tokio::time::sleep(interval).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(2)),
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::build(2, time::Duration::from_millis(1))
            .max_attempts(max_attempts)
            .provide()
    }

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(100))
            .maximum_interval(time::Duration::from_secs(60))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_millis(100));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_millis(200));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_millis(400));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(10, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(5))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(1));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(5));
        assert_eq!(retry_policy.retry_interval(40), time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = fast_policy(3)
            .run("flaky", |_: &String| true, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("connection reset".to_owned())
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = fast_policy(3)
            .run("constraint", |_: &String| false, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("check constraint violated".to_owned())
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_returns_first_success() {
        let result = fast_policy(3)
            .run("recovering", |_: &String| true, |attempt| async move {
                if attempt < 2 {
                    Err("timeout".to_owned())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }
}
