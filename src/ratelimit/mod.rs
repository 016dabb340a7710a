//! Rate limiting for outbound deliveries.
//!
//! Both limiters are fixed-window token buckets: up to `max_tokens` permits,
//! fully replenished once per interval. Callers are paced rather than
//! rejected; `check` blocks until a permit is available or the caller's
//! cancellation token fires.
//!
//! - [`TokenBucket`]: in-process, state behind a mutex.
//! - [`RedisTokenBucket`]: state in Redis, mutated only by a Lua script so
//!   independent processes share one budget without client-side locking.

pub mod distributed;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::config::{LimiterBackend, RateLimitConfig};
use crate::error::{Error, Result};

pub use distributed::RedisTokenBucket;
pub use local::TokenBucket;

/// A limiter the pipeline consults before every delivery.
#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Wait for a permit.
    ///
    /// # Errors
    /// [`crate::error::Error::Cancelled`] if `cancel` fires while waiting,
    /// [`crate::error::Error::RateLimitExceeded`] if a hard cap is hit,
    /// [`crate::error::Error::RetriesExhausted`] if a retry bound runs out.
    async fn check(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Limiter that always grants immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn check(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Build the limiter selected by configuration.
///
/// Connects to Redis when the Redis backend is selected.
pub async fn from_config(
    config: &RateLimitConfig,
    redis_url: &SecretString,
) -> Result<Arc<dyn RateLimiter>> {
    let limiter: Arc<dyn RateLimiter> = match config.backend {
        LimiterBackend::Local => {
            let mut bucket = TokenBucket::new(config.max_tokens, config.interval);
            if let Some(max_calls) = config.max_calls {
                bucket = bucket.with_call_cap(max_calls);
            }
            Arc::new(bucket)
        }
        LimiterBackend::Redis => {
            let mut bucket = RedisTokenBucket::connect(
                redis_url.expose_secret(),
                config.key.clone(),
                config.max_tokens,
                config.interval,
            )
            .await?;
            if let Some(attempts) = config.max_attempts {
                bucket = bucket.with_max_attempts(attempts);
            }
            Arc::new(bucket)
        }
        LimiterBackend::None => Arc::new(Unlimited),
    };
    Ok(limiter)
}
