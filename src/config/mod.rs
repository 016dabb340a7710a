//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on missing or malformed values.
//! Connection strings are wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::net::SocketAddr;
use std::time::Duration;

use crate::db::PoolSettings;
use crate::engine::{FetchStrategy, PipelineConfig};
use crate::error::{Error, Result};
use secrecy::SecretString;

/// Which rate limiter guards deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterBackend {
    /// In-process token bucket.
    Local,
    /// Token bucket shared through Redis.
    Redis,
    /// No throttling.
    None,
}

impl std::str::FromStr for LimiterBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(LimiterBackend::Local),
            "redis" => Ok(LimiterBackend::Redis),
            "none" | "off" => Ok(LimiterBackend::None),
            other => Err(Error::Config(format!(
                "unknown rate limiter {other:?} (expected \"local\", \"redis\" or \"none\")"
            ))),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub backend: LimiterBackend,
    /// Redis key the shared bucket lives under.
    pub key: String,
    pub max_tokens: u64,
    pub interval: Duration,
    /// Hard cap on total permits (local limiter only).
    pub max_calls: Option<u64>,
    /// Denials tolerated before giving up (Redis limiter only).
    pub max_attempts: Option<u32>,
}

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub redis_url: SecretString,
    pub listen_addr: SocketAddr,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub pool: PoolSettings,
    pub pipeline: PipelineConfig,
    pub rate_limit: RateLimitConfig,
    /// Deadline for one HTTP-triggered run.
    pub run_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let pipeline = PipelineConfig {
            strategy: vars.parsed("FETCH_STRATEGY", FetchStrategy::Streaming)?,
            batch_size: vars.positive("BATCH_SIZE", 100)?,
            worker_count: vars.positive("WORKER_COUNT", 50)?,
            queue_capacity: vars.positive("QUEUE_CAPACITY", 100)?,
            send_delay: Duration::from_millis(vars.parsed("SEND_DELAY_MS", 500)?),
            lease_timeout: match vars.parsed("LEASE_TIMEOUT_SECS", 300u64)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };

        let rate_limit = RateLimitConfig {
            backend: vars.parsed("RATE_LIMITER", LimiterBackend::Local)?,
            key: vars
                .get("RATE_LIMIT_KEY")
                .unwrap_or_else(|| "api_rate_limit".to_string()),
            max_tokens: vars.positive("RATE_LIMIT_MAX_TOKENS", 3)?,
            interval: Duration::from_millis(vars.positive("RATE_LIMIT_INTERVAL_MS", 10_000)?),
            max_calls: vars.optional("RATE_LIMIT_MAX_CALLS")?,
            max_attempts: vars.optional("RATE_LIMIT_MAX_ATTEMPTS")?,
        };

        let pool = PoolSettings {
            max_connections: vars.positive("DB_MAX_CONNECTIONS", 25)?,
            min_connections: vars.parsed("DB_MIN_CONNECTIONS", 5)?,
            max_lifetime: Duration::from_secs(vars.positive("DB_MAX_LIFETIME_SECS", 300)?),
            ..PoolSettings::default()
        };
        if pool.min_connections > pool.max_connections {
            return Err(Error::Config(format!(
                "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                pool.min_connections, pool.max_connections
            )));
        }

        Ok(Self {
            database_url: SecretString::from(vars.required("DATABASE_URL")?),
            redis_url: SecretString::from(
                vars.get("REDIS_URL")
                    .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            ),
            listen_addr: vars.parsed("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            otel_endpoint: vars.get("OTEL_ENDPOINT"),
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            pool,
            pipeline,
            rate_limit,
            run_timeout: vars
                .optional::<u64>("RUN_TIMEOUT_SECS")?
                .map(Duration::from_secs),
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `name`, if set.
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.get(name)
            .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
    }

    fn optional<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}")))
            })
            .transpose()
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    fn positive<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr + PartialOrd + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parsed(name, default)?;
        if value <= T::default() {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        Ok(value)
    }
}
