//! One worker of the pool: receive, throttle, send, mark.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::error::{Error, Result};
use crate::model::Email;
use crate::ratelimit::RateLimiter;
use crate::store::EmailStore;
use crate::telemetry::{metrics, spans};

use super::mailer::SimulatedMailer;

/// Receiving half of the run queue, shared by every worker.
pub(crate) type SharedQueue = Arc<Mutex<mpsc::Receiver<Email>>>;

/// Counters every worker adds to. Read only after all workers are joined.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    processed: AtomicU64,
    update_failures: AtomicU64,
    claims_lost: AtomicU64,
}

impl Tally {
    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub(crate) fn update_failures(&self) -> u64 {
        self.update_failures.load(Ordering::Acquire)
    }

    pub(crate) fn claims_lost(&self) -> u64 {
        self.claims_lost.load(Ordering::Acquire)
    }
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) queue: SharedQueue,
    pub(crate) store: Arc<dyn EmailStore>,
    pub(crate) limiter: Arc<dyn RateLimiter>,
    pub(crate) mailer: SimulatedMailer,
    pub(crate) tally: Arc<Tally>,
    pub(crate) cancel: CancellationToken,
}

impl Worker {
    /// Drain the queue until it is closed and empty.
    ///
    /// Returns early only on cancellation or a hard rate limit; per-email
    /// update failures are logged and skipped.
    pub(crate) async fn run(self) -> Result<()> {
        debug!(worker_id = self.id, "worker started");
        while let Some(email) = self.next().await {
            let span = spans::start_delivery_span(email.id, self.id);
            self.deliver(email).instrument(span).await?;
        }
        debug!(worker_id = self.id, "worker drained");
        Ok(())
    }

    async fn next(&self) -> Option<Email> {
        self.queue.lock().await.recv().await
    }

    async fn deliver(&self, email: Email) -> Result<()> {
        self.limiter.check(&self.cancel).await?;

        // A claimed email is only sent while this run still holds the claim.
        let claim = match email.claimed_at {
            Some(claimed_at) => match self.store.renew_claim(email.id, claimed_at).await {
                Ok(Some(renewed)) => Some(renewed),
                Ok(None) => {
                    self.tally.claims_lost.fetch_add(1, Ordering::AcqRel);
                    warn!(
                        worker_id = self.id,
                        email_id = email.id,
                        "claim lost before send, skipping"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.record_update_failure(email.id, &e);
                    return Ok(());
                }
            },
            None => None,
        };

        let detail = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            detail = self.mailer.send(&email) => detail,
        };

        // The send already happened; record it even if cancellation lands now.
        let committed = match claim {
            Some(claimed_at) => {
                self.store
                    .complete_claim(email.id, claimed_at, &detail)
                    .await
            }
            None => self.store.update_status(email.id, &detail).await,
        };
        match committed {
            Ok(()) => {
                self.tally.processed.fetch_add(1, Ordering::AcqRel);
                metrics::emails_processed().add(1, &[]);
                metrics::email_status_updates().add(1, &[KeyValue::new("result", "ok")]);
            }
            Err(e) => self.record_update_failure(email.id, &e),
        }
        Ok(())
    }

    fn record_update_failure(&self, email_id: i64, error: &Error) {
        self.tally.update_failures.fetch_add(1, Ordering::AcqRel);
        metrics::email_status_updates().add(1, &[KeyValue::new("result", "error")]);
        warn!(
            worker_id = self.id,
            email_id,
            error = %error,
            "failed to update email status"
        );
    }
}
