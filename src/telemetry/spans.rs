//! Span helpers for pipeline runs and deliveries.

use tracing::Span;
use uuid::Uuid;

/// Start the span wrapping one pipeline run.
///
/// `run.processed` is declared empty and filled by [`record_processed`].
pub fn start_run_span(run_id: &Uuid, strategy: &str) -> Span {
    tracing::info_span!(
        "pipeline.run",
        "run.id" = %run_id,
        "run.strategy" = strategy,
        "run.processed" = tracing::field::Empty,
    )
}

/// Start the span wrapping one email delivery.
pub fn start_delivery_span(email_id: i64, worker_id: usize) -> Span {
    tracing::debug_span!(
        "email.deliver",
        "email.id" = email_id,
        "worker.id" = worker_id,
    )
}

/// Record the final processed count on a run span.
pub fn record_processed(span: &Span, processed: u64) {
    span.record("run.processed", processed);
}
