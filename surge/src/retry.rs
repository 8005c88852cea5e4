//! Bounded retry of transport level failures.
//!
//! Only [`AttemptStatus::NetworkError`] is retried. A response that arrived but
//! failed its check is a real answer from the service and is returned immediately.
//! When the attempts run out, the last result is returned as is; callers always
//! inspect [`AttemptResult::status`] rather than handling an error.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Classification of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// A response arrived and passed its check.
    Success,
    /// A response arrived but failed its check.
    Failure,
    /// No response arrived.
    NetworkError,
}

/// Outcome of an operation, produced once per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult<T> {
    pub status: AttemptStatus,
    pub latency: Duration,
    /// Whatever the attempt produced; `None` when nothing was received.
    pub payload: Option<T>,
    /// Attempts made so far, including this one.
    pub attempts: u32,
}

impl<T> AttemptResult<T> {
    pub fn success(latency: Duration, payload: T) -> Self {
        Self {
            status: AttemptStatus::Success,
            latency,
            payload: Some(payload),
            attempts: 1,
        }
    }

    pub fn failure(latency: Duration, payload: Option<T>) -> Self {
        Self {
            status: AttemptStatus::Failure,
            latency,
            payload,
            attempts: 1,
        }
    }

    pub fn network_error(latency: Duration) -> Self {
        Self {
            status: AttemptStatus::NetworkError,
            latency,
            payload: None,
            attempts: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}

/// A unit of work that can be attempted any number of times.
///
/// Each call to [`Operation::attempt`] must be independent: retrying re-sends the
/// same request, it does not resume a previous one.
pub trait Operation
where
    Self: Send + Sync,
{
    type Output: Send;

    /// Name used in logs and as metric tag.
    fn name(&self) -> &str;

    fn attempt(&self) -> impl Future<Output = AttemptResult<Self::Output>> + Send;
}

/// How many times to attempt and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Fixed pause before each retry.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attempt `operation` until it produces a response or the attempts run out.
    pub async fn execute<O>(&self, operation: &O) -> AttemptResult<O::Output>
    where
        O: Operation,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut result = operation.attempt().await;
            result.attempts = attempt;

            match result.status {
                AttemptStatus::NetworkError if attempt < max_attempts => {
                    tracing::warn!(
                        "{} attempt {attempt}/{max_attempts} got no response, retrying in {:?}",
                        operation.name(),
                        self.policy.delay
                    );
                    sleep(self.policy.delay).await;
                    attempt += 1;
                }
                AttemptStatus::NetworkError => {
                    tracing::warn!(
                        "{} got no response after {attempt} attempts",
                        operation.name()
                    );
                    return result;
                }
                _ => {
                    if attempt > 1 {
                        tracing::debug!("{} answered after {attempt} attempts", operation.name());
                    }
                    return result;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Replays a fixed script of statuses and remembers when each attempt started.
    struct Scripted {
        script: Vec<AttemptStatus>,
        started: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(script: Vec<AttemptStatus>) -> Self {
            Self {
                script,
                started: Mutex::new(Vec::new()),
            }
        }

        fn always(status: AttemptStatus) -> Self {
            Self::new(vec![status; 64])
        }

        fn calls(&self) -> Vec<Instant> {
            self.started.lock().clone()
        }
    }

    impl Operation for Scripted {
        type Output = u16;

        fn name(&self) -> &str {
            "scripted"
        }

        async fn attempt(&self) -> AttemptResult<u16> {
            let index = {
                let mut started = self.started.lock();
                started.push(Instant::now());
                started.len() - 1
            };
            let latency = Duration::from_millis(5);
            match self.script[index] {
                AttemptStatus::Success => AttemptResult::success(latency, 200),
                AttemptStatus::Failure => AttemptResult::failure(latency, Some(500)),
                AttemptStatus::NetworkError => AttemptResult::network_error(latency),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_use_every_attempt() {
        for max_attempts in 1..=5 {
            let delay = Duration::from_millis(100);
            let executor = RetryExecutor::new(RetryPolicy::new(max_attempts, delay));
            let op = Scripted::always(AttemptStatus::NetworkError);

            let result = executor.execute(&op).await;

            assert_eq!(result.status, AttemptStatus::NetworkError);
            assert_eq!(result.attempts, max_attempts);
            assert!(result.payload.is_none());

            let calls = op.calls();
            assert_eq!(calls.len(), max_attempts as usize);
            for pair in calls.windows(2) {
                assert!(pair[1] - pair[0] >= delay);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_attempts_take_two_delays() {
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(100)));
        let op = Scripted::always(AttemptStatus::NetworkError);

        let start = Instant::now();
        executor.execute(&op).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(210));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(100)));
        let op = Scripted::always(AttemptStatus::Failure);

        let start = Instant::now();
        let result = executor.execute(&op).await;

        assert_eq!(result.status, AttemptStatus::Failure);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.payload, Some(500));
        assert_eq!(op.calls().len(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_error() {
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(100)));
        let op = Scripted::new(vec![AttemptStatus::NetworkError, AttemptStatus::Success]);

        let result = executor.execute(&op).await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
        assert_eq!(result.payload, Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let executor = RetryExecutor::new(RetryPolicy::new(0, Duration::from_millis(100)));
        let op = Scripted::always(AttemptStatus::NetworkError);

        let result = executor.execute(&op).await;

        assert_eq!(result.attempts, 1);
        assert_eq!(op.calls().len(), 1);
    }
}
