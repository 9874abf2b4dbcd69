//! Bounded, fixed-delay retries.
//!
//! Every phase funnels its fallible calls through `RetryPolicy::execute`
//! so retry semantics live in one place. The wait between attempts is a
//! constant: there is no jitter and no backoff growth.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Classify, ErrorKind};

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Fixed pause between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a kind outside `retry_on`,
    /// or the attempt budget is spent.
    ///
    /// On exhaustion the error from the final attempt is returned. The
    /// delay is slept exactly `attempts - 1` times.
    pub async fn execute<T, E, F, Fut>(
        &self,
        what: &str,
        retry_on: &[ErrorKind],
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let kind = e.kind();
                    if !retry_on.contains(&kind) {
                        return Err(e);
                    }
                    if attempt >= max {
                        warn!(what, attempts = attempt, %kind, error = %e, "retries exhausted");
                        return Err(e);
                    }
                    warn!(what, attempt, max, %kind, error = %e, "attempt failed, retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Five attempts, five seconds apart.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorKind);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error ({})", self.0)
        }
    }

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts_and_sleeps_between() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(4, Duration::from_secs(5));
        let start = tokio::time::Instant::now();

        let result: Result<(), TestError> = policy
            .execute("flaky", &[ErrorKind::Connection], || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorKind::Connection))
            })
            .await;

        assert!(matches!(result, Err(TestError(ErrorKind::Connection))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Three waits between four attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_kind_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let result: Result<(), TestError> = policy
            .execute("fatal", &[ErrorKind::Timeout], || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorKind::HttpStatus))
            })
            .await;

        assert!(matches!(result, Err(TestError(ErrorKind::HttpStatus))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let start = tokio::time::Instant::now();

        let result = policy
            .execute("eventually", crate::TRANSIENT, || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TestError(ErrorKind::MalformedResponse))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let _: Result<(), TestError> = policy
            .execute("zero", &[ErrorKind::Connection], || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(ErrorKind::Connection))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }
}
