//! Redis-backed token bucket shared across processes.
//!
//! The bucket lives in a hash under the limiter key with fields `tokens`
//! and `last_refill` (ms since the Unix epoch). Every read-modify-write runs
//! inside one Lua script, which Redis executes atomically.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

use super::RateLimiter;

/// KEYS[1] = bucket key; ARGV = max_tokens, interval_ms, now_ms.
/// Returns 1 when a token was taken, 0 when the bucket is empty.
const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local data = redis.call("HMGET", key, "tokens", "last_refill")
local tokens = tonumber(data[1]) or max_tokens
local last_refill = tonumber(data[2]) or now

if now - last_refill >= interval then
    tokens = max_tokens
    last_refill = now
end

if tokens > 0 then
    tokens = tokens - 1
    redis.call("HSET", key, "tokens", tokens, "last_refill", last_refill)
    redis.call("PEXPIRE", key, interval * 2)
    return 1
end

return 0
"#;

/// Token bucket whose state is owned by Redis.
///
/// On denial the caller waits one full interval before asking again; it
/// does not compute the exact time to the next refill. Retries run in a
/// loop, optionally bounded by `max_attempts`.
#[derive(Clone)]
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    script: redis::Script,
    key: String,
    max_tokens: u64,
    interval: Duration,
    max_attempts: Option<u32>,
}

impl RedisTokenBucket {
    /// Connect to Redis at `url` and build a limiter under `key`.
    pub async fn connect(
        url: &str,
        key: impl Into<String>,
        max_tokens: u64,
        interval: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, key, max_tokens, interval))
    }

    pub fn new(
        conn: ConnectionManager,
        key: impl Into<String>,
        max_tokens: u64,
        interval: Duration,
    ) -> Self {
        Self {
            conn,
            script: redis::Script::new(TOKEN_BUCKET_LUA),
            key: key.into(),
            max_tokens: max_tokens.max(1),
            interval,
            max_attempts: None,
        }
    }

    /// Give up with [`Error::RetriesExhausted`] after `attempts` denials.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Run the script once. `true` means a token was taken.
    pub async fn try_acquire(&self) -> Result<bool> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let interval_ms = self.interval.as_millis() as u64;
        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .script
            .key(&self.key)
            .arg(self.max_tokens)
            .arg(interval_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(allowed == 1)
    }
}

#[async_trait]
impl RateLimiter for RedisTokenBucket {
    async fn check(&self, cancel: &CancellationToken) -> Result<()> {
        let mut denials: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let allowed = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                allowed = self.try_acquire() => allowed?,
            };
            if allowed {
                return Ok(());
            }

            denials += 1;
            if let Some(max) = self.max_attempts {
                if denials >= max {
                    return Err(Error::RetriesExhausted { attempts: denials });
                }
            }

            if denials == 1 {
                info!(
                    key = %self.key,
                    wait_ms = self.interval.as_millis() as u64,
                    "rate limit reached, waiting before retrying"
                );
            } else {
                debug!(key = %self.key, denials, "still rate limited");
            }
            metrics::rate_limit_waits().add(1, &[KeyValue::new("limiter", "redis")]);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
