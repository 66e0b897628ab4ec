//! Bounded exponential-backoff retry around an async operation.

use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Handed to the observer after a failed attempt that will be retried.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 1-based index of the attempt that just failed.
    pub attempt: u32,
    pub error: &'a E,
    /// Sleep before the next attempt.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or the attempt budget is spent. The error of
    /// the final attempt is returned as-is.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_observed(op, |_| {}).await
    }

    /// Same as [`RetryPolicy::run`] but reports every retried failure to
    /// `observer`. The observer cannot influence control flow.
    pub async fn run_observed<T, E, F, Fut, O>(&self, mut op: F, mut observer: O) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(RetryAttempt<'_, E>),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay.min(self.max_delay);
        let mut attempt = 1;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if attempt >= max_attempts {
                return Err(error);
            }

            observer(RetryAttempt {
                attempt,
                error: &error,
                delay,
            });
            tokio::time::sleep(delay).await;
            delay = self.next_delay(delay);
            attempt += 1;
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor > 0.0 {
            self.backoff_factor
        } else {
            1.0
        };
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .map_or(self.max_delay, |scaled| scaled.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
        assert_eq!(policy.backoff_factor, 2.0);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let mut observed = Vec::new();
        let result: Result<&str, String> = fast_policy(5)
            .run_observed(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n <= 2 {
                            Err(format!("fail {n}"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                |attempt| observed.push((attempt.attempt, attempt.error.clone())),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            observed,
            vec![(1, "fail 1".to_string()), (2, "fail 2".to_string())]
        );
    }

    #[tokio::test]
    async fn always_failing_op_returns_last_error() {
        let calls = AtomicU32::new(0);
        let mut observer_calls = 0;
        let result: Result<(), String> = fast_policy(4)
            .run_observed(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(format!("attempt {n}")) }
                },
                |_| observer_calls += 1,
            )
            .await;

        assert_eq!(result.unwrap_err(), "attempt 4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(observer_calls, 3);
    }

    #[tokio::test]
    async fn single_attempt_does_not_wait() {
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        let started = std::time::Instant::now();
        let result: Result<(), &str> = policy.run(|| async { Err("nope") }).await;
        assert_eq!(result.unwrap_err(), "nope");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn delays_grow_and_respect_cap() {
        let mut delays = Vec::new();
        let _: Result<(), ()> = fast_policy(5)
            .run_observed(|| async { Err(()) }, |attempt| delays.push(attempt.delay))
            .await;
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(4),
            ]
        );
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _: Result<(), ()> = fast_policy(0)
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
