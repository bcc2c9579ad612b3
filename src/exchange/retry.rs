//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;

use crate::errors::Result;

/// Retry policy for exchange calls
///
/// Every policy is bounded twice: by `max_attempts` and by `deadline_ms`
/// measured from the first attempt. Only errors for which
/// [`Error::is_retryable`](crate::errors::Error::is_retryable) holds are retried.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub deadline_ms: u64,
    /// Jitter as a fraction of each delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
            deadline_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
        )
    }
}

/// Exponential backoff: `min(max_delay, base * 2^attempt)` plus jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max_delay);
        self.attempt = self.attempt.saturating_add(1);

        let range = delay.as_secs_f64() * self.jitter;
        if range <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(-range..=range);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted
///
/// On exhaustion the last error is returned unchanged, so a run of timeouts
/// surfaces as `Timeout`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut backoff = policy.backoff();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!("{} failed after {} attempts: {}", operation, attempt, err);
            return Err(err);
        }

        let delay = backoff.next_delay();
        if started.elapsed() + delay > policy.deadline() {
            warn!("{} retry deadline reached after {} attempts: {}", operation, attempt, err);
            return Err(err);
        }

        warn!(
            "{} failed (attempt {}/{}), retrying in {}ms: {}",
            operation,
            attempt,
            max_attempts,
            delay.as_millis(),
            err
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, deadline_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            deadline_ms,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 0.0);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.2);
        let secs = backoff.next_delay().as_secs_f64();
        assert!((8.0..=12.0).contains(&secs), "delay was {secs}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_surface_after_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = retry(&policy(3, 60_000), "get_price", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout("GET /api/v3/ticker/price".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        for err in [
            Error::Authentication("bad signature".into()),
            Error::Network("connection refused".into()),
            Error::OrderNotFound("grid1".into()),
            Error::Exchange { code: -2010, message: "insufficient balance".into() },
        ] {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let expected = err.clone();
            let result: Result<()> = retry(&policy(5, 60_000), "op", || {
                let counter = counter.clone();
                let err = err.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(err)
                }
            })
            .await;
            assert_eq!(result, Err(expected));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry(&policy(3, 60_000), "place_order", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Exchange { code: -1003, message: "too many requests".into() })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();
        let result: Result<()> = retry(&policy(10, 2_500), "get_balance", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout("GET /api/v3/account".into()))
            }
        })
        .await;

        assert!(result.is_err());
        // 1s sleep fits the deadline, the following 2s one does not
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_millis(2_500));
    }
}
