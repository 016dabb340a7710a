//! Pipeline coordinator: one processing run from fetch to final count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Email;
use crate::ratelimit::RateLimiter;
use crate::store::EmailStore;
use crate::telemetry::{metrics, spans};

use super::mailer::SimulatedMailer;
use super::worker::{SharedQueue, Tally, Worker};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the producer pulls emails out of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Page through every pending email with plain reads, queue them all,
    /// then start the workers.
    Bulk,
    /// Start the workers, then claim batches until the backlog is empty,
    /// feeding the bounded queue as batches arrive.
    Streaming,
}

impl FetchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStrategy::Bulk => "bulk",
            FetchStrategy::Streaming => "streaming",
        }
    }
}

impl std::fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FetchStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bulk" => Ok(FetchStrategy::Bulk),
            "streaming" | "stream" => Ok(FetchStrategy::Streaming),
            other => Err(Error::Config(format!(
                "unknown fetch strategy {other:?} (expected \"bulk\" or \"streaming\")"
            ))),
        }
    }
}

/// Tunables for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub strategy: FetchStrategy,
    /// Rows per fetch page or claim batch.
    pub batch_size: i64,
    /// Fixed worker pool size.
    pub worker_count: usize,
    /// Bounded queue capacity for the streaming strategy.
    pub queue_capacity: usize,
    /// Artificial delay of the simulated send.
    pub send_delay: Duration,
    /// Claims older than this are returned to `pending` before each run.
    pub lease_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strategy: FetchStrategy::Streaming,
            batch_size: 100,
            worker_count: 50,
            queue_capacity: 100,
            send_delay: Duration::from_millis(500),
            lease_timeout: Some(Duration::from_secs(300)),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a completed run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Emails sent and successfully marked.
    pub processed: u64,
    /// Emails handed to the workers.
    pub dispatched: u64,
    /// Emails sent whose status update failed.
    pub update_failures: u64,
    /// Claimed emails skipped because another run took them over.
    pub claims_lost: u64,
}

/// A run that stopped early. Carries what was achieved before the stop.
#[derive(Debug, thiserror::Error)]
#[error("run aborted after {processed} processed emails: {source}")]
pub struct RunError {
    pub processed: u64,
    pub dispatched: u64,
    #[source]
    pub source: Error,
}

impl RunError {
    fn before_dispatch(source: Error) -> Self {
        Self {
            processed: 0,
            dispatched: 0,
            source,
        }
    }

    /// Did anything reach the workers before the run stopped?
    pub fn dispatched_any(&self) -> bool {
        self.dispatched > 0
    }
}

/// Producer failure, with how many emails it had queued by then.
struct ProduceError {
    dispatched: u64,
    source: Error,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the claim → dispatch → throttle → commit pipeline.
///
/// Cheap to clone; every clone shares the store and limiter.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn EmailStore>,
    limiter: Arc<dyn RateLimiter>,
    mailer: SimulatedMailer,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn EmailStore>,
        limiter: Arc<dyn RateLimiter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            mailer: SimulatedMailer::new(config.send_delay),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EmailStore> {
        &self.store
    }

    /// Process the current backlog once.
    ///
    /// Per-email update failures are contained and only lower the count.
    /// A fetch failure, cancellation, or a hard rate limit stops the run; the
    /// queue is closed, in-flight workers are drained, and the partial count
    /// is returned inside [`RunError`].
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = spans::start_run_span(&run_id, self.config.strategy.as_str());
        let started = Instant::now();

        let result = self.run_inner(run_id, cancel).instrument(span.clone()).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let outcome = if result.is_ok() { "ok" } else { "aborted" };
        metrics::run_duration_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("strategy", self.config.strategy.as_str()),
                KeyValue::new("result", outcome),
            ],
        );

        span.in_scope(|| match &result {
            Ok(summary) => {
                spans::record_processed(&span, summary.processed);
                info!(
                    processed = summary.processed,
                    dispatched = summary.dispatched,
                    update_failures = summary.update_failures,
                    claims_lost = summary.claims_lost,
                    elapsed_ms,
                    "run finished"
                );
            }
            Err(e) => {
                spans::record_processed(&span, e.processed);
                error!(
                    processed = e.processed,
                    dispatched = e.dispatched,
                    error = %e.source,
                    elapsed_ms,
                    "run aborted"
                );
            }
        });

        result
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunSummary, RunError> {
        if let Some(lease) = self.config.lease_timeout.filter(|l| !l.is_zero()) {
            let released = self
                .store
                .reclaim_stale(lease)
                .await
                .map_err(RunError::before_dispatch)?;
            if released > 0 {
                warn!(released, "returned emails with expired claims to pending");
            }
        }

        match self.config.strategy {
            FetchStrategy::Bulk => self.run_bulk(run_id, cancel).await,
            FetchStrategy::Streaming => self.run_streaming(run_id, cancel).await,
        }
    }

    async fn run_bulk(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunSummary, RunError> {
        let emails = self
            .fetch_all_pending(cancel)
            .await
            .map_err(RunError::before_dispatch)?;

        if emails.is_empty() {
            debug!("no pending emails");
            return Ok(RunSummary {
                run_id,
                processed: 0,
                dispatched: 0,
                update_failures: 0,
                claims_lost: 0,
            });
        }

        info!(count = emails.len(), "fetched pending emails");

        // Sized to the backlog so the whole set is queued before any worker starts.
        let (tx, rx) = mpsc::channel(emails.len());
        let dispatched = emails.len() as u64;
        for email in emails {
            tx.try_send(email)
                .map_err(|e| RunError::before_dispatch(Error::Other(e.to_string())))?;
        }
        drop(tx);

        let tally = Arc::new(Tally::default());
        let handles = self.spawn_workers(rx, &tally, cancel);
        let worker_error = join_workers(handles).await;

        finish(run_id, &tally, dispatched, None, worker_error)
    }

    async fn run_streaming(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunSummary, RunError> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let tally = Arc::new(Tally::default());
        let handles = self.spawn_workers(rx, &tally, cancel);

        let produced = self.produce_claimed(&tx, cancel).await;
        // Closing the queue is the only stop signal the workers get.
        drop(tx);
        let worker_error = join_workers(handles).await;

        match produced {
            Ok(dispatched) => finish(run_id, &tally, dispatched, None, worker_error),
            Err(e) => finish(run_id, &tally, e.dispatched, Some(e.source), worker_error),
        }
    }

    /// Page through pending emails with plain reads. Nothing is updated
    /// until the workers start, so offsets stay stable within this run.
    async fn fetch_all_pending(&self, cancel: &CancellationToken) -> Result<Vec<Email>> {
        let page_size = self.config.batch_size.max(1);
        let mut emails = Vec::new();
        let mut offset = 0;
        loop {
            let page = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                page = self.store.fetch_batch(page_size, offset) => page?,
            };
            let len = page.len() as i64;
            emails.extend(page);
            if len < page_size {
                return Ok(emails);
            }
            offset += len;
        }
    }

    /// Claim batches until one comes back empty, pushing each email into
    /// the queue. Blocks on a full queue, which paces claiming to worker
    /// throughput. Returns how many emails were queued.
    async fn produce_claimed(
        &self,
        tx: &mpsc::Sender<Email>,
        cancel: &CancellationToken,
    ) -> std::result::Result<u64, ProduceError> {
        let mut dispatched = 0u64;
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Err(ProduceError { dispatched, source: Error::Cancelled }),
                batch = self.store.claim_batch(self.config.batch_size.max(1)) => batch,
            };
            let batch = batch.map_err(|source| ProduceError { dispatched, source })?;
            if batch.is_empty() {
                debug!(dispatched, "backlog exhausted");
                return Ok(dispatched);
            }
            debug!(size = batch.len(), "claimed batch");

            for email in batch {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProduceError { dispatched, source: Error::Cancelled }),
                    sent = tx.send(email) => {
                        if sent.is_err() {
                            // Every worker has exited; their errors explain why.
                            warn!(dispatched, "all workers gone, stopping producer");
                            return Ok(dispatched);
                        }
                    }
                }
                dispatched += 1;
            }
        }
    }

    fn spawn_workers(
        &self,
        rx: mpsc::Receiver<Email>,
        tally: &Arc<Tally>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<Result<()>>> {
        let queue: SharedQueue = Arc::new(Mutex::new(rx));
        let worker_count = self.config.worker_count.max(1);
        debug!(worker_count, "spawning workers");

        (0..worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&queue),
                    store: Arc::clone(&self.store),
                    limiter: Arc::clone(&self.limiter),
                    mailer: self.mailer,
                    tally: Arc::clone(tally),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run().in_current_span())
            })
            .collect()
    }
}

/// Wait for every worker. Returns the first error any of them stopped with.
async fn join_workers(handles: Vec<JoinHandle<Result<()>>>) -> Option<Error> {
    let mut first_error = None;
    for (worker_id, handle) in handles.into_iter().enumerate() {
        let err = match handle.await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(join_error) => Error::WorkerPanic {
                worker_id,
                message: join_error.to_string(),
            },
        };
        debug!(worker_id, error = %err, "worker stopped early");
        first_error.get_or_insert(err);
    }
    first_error
}

fn finish(
    run_id: Uuid,
    tally: &Tally,
    dispatched: u64,
    producer_error: Option<Error>,
    worker_error: Option<Error>,
) -> std::result::Result<RunSummary, RunError> {
    let processed = tally.processed();
    match producer_error.or(worker_error) {
        Some(source) => Err(RunError {
            processed,
            dispatched,
            source,
        }),
        None => Ok(RunSummary {
            run_id,
            processed,
            dispatched,
            update_failures: tally.update_failures(),
            claims_lost: tally.claims_lost(),
        }),
    }
}
