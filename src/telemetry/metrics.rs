//! Metric instrument factories for mailpump.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without one installed the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("mailpump")
}

/// Counter: emails delivered and marked sent.
pub fn emails_processed() -> Counter<u64> {
    meter()
        .u64_counter("mailpump.emails.processed")
        .with_description("Emails delivered and marked sent")
        .build()
}

/// Counter: rows claimed by the lock-skip claim.
pub fn emails_claimed() -> Counter<u64> {
    meter()
        .u64_counter("mailpump.emails.claimed")
        .with_description("Emails claimed for processing")
        .build()
}

/// Counter: status update attempts.
/// Labels: `result` ("ok" | "error").
pub fn email_status_updates() -> Counter<u64> {
    meter()
        .u64_counter("mailpump.emails.status_updates")
        .with_description("Email status update attempts")
        .build()
}

/// Counter: times a caller had to wait for a rate limit permit.
/// Labels: `limiter` ("local" | "redis").
pub fn rate_limit_waits() -> Counter<u64> {
    meter()
        .u64_counter("mailpump.rate_limit.waits")
        .with_description("Rate limiter waits")
        .build()
}

/// Histogram: pipeline run duration in milliseconds.
/// Labels: `strategy`, `result` ("ok" | "aborted").
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("mailpump.run.duration_ms")
        .with_description("Pipeline run duration in milliseconds")
        .with_unit("ms")
        .build()
}
