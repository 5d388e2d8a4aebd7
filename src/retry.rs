//! Bounded retries with jittered exponential backoff

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;

/// Attempt count and deadline bounding a retried operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Option<Instant>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Delay before retrying after `attempt` failed attempts
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let jitter_ms = delay.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn allows_retry_after(&self, attempt: u32, delay: Duration) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match self.deadline {
            Some(deadline) => Instant::now() + delay < deadline,
            None => true,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or
/// the policy is exhausted. The last error is returned in the latter cases.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => {
                let delay = policy.delay_for(attempt);
                if !policy.allows_retry_after(attempt, delay) {
                    tracing::warn!(
                        "{} failed after {} attempt(s): {}",
                        operation_name,
                        attempt,
                        e
                    );
                    return Err(e);
                }
                tracing::debug!(
                    "{} attempt {} failed ({}), retrying in {:?}",
                    operation_name,
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TopologyError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(400));
        assert!(policy.delay_for(1) >= Duration::from_millis(100));
        assert!(policy.delay_for(1) <= Duration::from_millis(125));
        assert!(policy.delay_for(8) <= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let result = retry(&policy, "status fetch", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TopologyError::timeout("status"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_permanent_error() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry(&policy, "join", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TopologyError::JoinRejected {
                    cache_name: "c".to_string(),
                    reason: "checksum".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(TopologyError::JoinRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_attempt_limit() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50));
        let result: Result<()> =
            retry(&policy, "status fetch", |_| async { Err(TopologyError::timeout("status")) }).await;
        assert!(matches!(result, Err(TopologyError::Timeout { .. })));
    }
}
