//! Error types for mailpump.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("email not found: {0}")]
    NotFound(i64),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("claim on email {0} was lost to another run")]
    ClaimLost(i64),

    #[error("rate limit reached: max {max_calls} calls")]
    RateLimitExceeded { max_calls: u64 },

    #[error("rate limit still exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic { worker_id: usize, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short machine-readable kind, used in API error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Config(_) => "config",
            Error::Database(_) | Error::Migrate(_) => "store",
            Error::Redis(_) => "rate_limiter",
            Error::ClaimLost(_) => "claim_lost",
            Error::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Error::RetriesExhausted { .. } => "rate_limit_retries_exhausted",
            Error::Cancelled => "cancelled",
            Error::WorkerPanic { .. } => "worker_panic",
            Error::Io(_) => "io",
            Error::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
