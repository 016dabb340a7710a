//! In-process token bucket.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

use super::RateLimiter;

/// Fixed-window token bucket guarded by a mutex.
///
/// The mutex is held only for bookkeeping. A caller that finds the bucket
/// empty computes the time to the next refill, releases the lock, sleeps,
/// and then retries from scratch.
///
/// With a call cap configured, the bucket turns strict: once `max_calls`
/// permits have been granted in total, every further `check` fails with
/// [`Error::RateLimitExceeded`] regardless of refills.
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: u64,
    interval: Duration,
    max_calls: Option<u64>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
    granted: u64,
}

/// Outcome of one bookkeeping pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    Granted,
    Wait(Duration),
    Capped(u64),
}

impl TokenBucket {
    /// A full bucket of `max_tokens` permits refilled every `interval`.
    /// A zero capacity is treated as one.
    pub fn new(max_tokens: u64, interval: Duration) -> Self {
        let max_tokens = max_tokens.max(1);
        Self {
            max_tokens,
            interval,
            max_calls: None,
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
                granted: 0,
            }),
        }
    }

    /// Reject outright once `max_calls` permits have been granted.
    pub fn with_call_cap(mut self, max_calls: u64) -> Self {
        self.max_calls = Some(max_calls);
        self
    }

    /// Permits left in the current window.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now.duration_since(state.last_refill) >= self.interval {
            state.tokens = self.max_tokens;
            state.last_refill = now;
        }
    }

    fn try_acquire(&self) -> Acquire {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(max_calls) = self.max_calls {
            if state.granted >= max_calls {
                return Acquire::Capped(max_calls);
            }
        }

        self.refill(&mut state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            state.granted += 1;
            Acquire::Granted
        } else {
            let next_refill = state.last_refill + self.interval;
            Acquire::Wait(next_refill.saturating_duration_since(now))
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn check(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.try_acquire() {
                Acquire::Granted => return Ok(()),
                Acquire::Capped(max_calls) => return Err(Error::RateLimitExceeded { max_calls }),
                Acquire::Wait(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
                    metrics::rate_limit_waits().add(1, &[KeyValue::new("limiter", "local")]);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_reports_time_to_next_refill() {
        let bucket = TokenBucket::new(2, Duration::from_secs(10));
        assert_eq!(bucket.try_acquire(), Acquire::Granted);
        assert_eq!(bucket.try_acquire(), Acquire::Granted);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(bucket.try_acquire(), Acquire::Wait(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_resets_to_max_not_proportionally() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert_eq!(bucket.try_acquire(), Acquire::Granted);
        }
        assert_eq!(bucket.available(), 0);

        // Several elapsed intervals still refill to exactly max.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(bucket.available(), 3);
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let bucket = TokenBucket::new(0, Duration::from_secs(1));
        assert_eq!(bucket.available(), 1);
    }
}
