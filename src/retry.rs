//! Retry, backoff, and timeout utilities.
//!
//! Shared by the HTTP API client (bounded retries of idempotent reads) and
//! the gateway connection worker (reconnect backoff).

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay applied before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff delay.
    pub max_backoff: Duration,
    /// Maximum random jitter added on top of each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Short policy for stateless HTTP reads.
    pub fn http() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            jitter: Duration::from_millis(50),
        }
    }

    /// Policy for re-establishing a dropped gateway connection.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }

    /// Delay to wait after the failed `attempt` (1-based) before the next one.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(32) as u32;
        let base = self
            .initial_backoff
            .checked_mul(1u32 << doublings.min(31))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        base + jitter_for(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::http()
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy's attempts are exhausted.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Applies an optional timeout to a future. `None` waits indefinitely.
pub async fn with_timeout<T, Fut>(
    timeout: Option<Duration>,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future).await,
        None => Ok(future.await),
    }
}

fn jitter_for(max_jitter: Duration, attempt: usize) -> Duration {
    let limit = max_jitter.as_nanos().min(u128::from(u64::MAX)) as u64;
    if limit == 0 {
        return Duration::ZERO;
    }

    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default() as u64;
    let seed = clock.rotate_left(17) ^ (attempt as u64).wrapping_mul(0xA24B_AED4_963E_E407);
    Duration::from_nanos(seed % (limit + 1))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{retry_async, with_timeout, RetryPolicy};

    fn quick_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(350));
    }

    #[test]
    fn reconnect_backoff_settles_at_two_seconds() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::reconnect()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1600));
        assert_eq!(policy.delay_for_attempt(policy.max_attempts), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(5),
            ..quick_policy(3)
        };
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_millis(2) + Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result = retry_async(
            &quick_policy(3),
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("retry")
                    } else {
                        Ok("ok")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), &str> = retry_async(
            &quick_policy(2),
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_when_retry_predicate_rejects() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), &str> = retry_async(
            &quick_policy(5),
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
            |_| false,
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn optional_timeout_without_limit_waits() {
        let value = with_timeout(None, async { 7 }).await;
        assert_eq!(value.ok(), Some(7));

        let elapsed = with_timeout(
            Some(Duration::from_millis(5)),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(elapsed.is_err());
    }
}
