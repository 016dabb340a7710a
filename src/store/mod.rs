//! Storage seam between the pipeline and the email table.
//!
//! The pipeline only talks to [`EmailStore`]. Production uses the Postgres
//! implementation on [`crate::db::Db`]; tests and local dry runs use
//! [`MemoryStore`], which honors the same claim contract in-process.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::Email;

pub use memory::MemoryStore;

/// Detail string recorded on every simulated delivery.
pub const SENT_DETAIL: &str = "Mock email sent successfully";

/// Storage operations required by the pipeline.
#[async_trait]
pub trait EmailStore: Send + Sync + 'static {
    /// Pending emails ordered by id, `limit` rows starting at `offset`.
    ///
    /// Plain read, no locks. Two concurrent callers can see the same rows.
    async fn fetch_batch(&self, limit: i64, offset: i64) -> Result<Vec<Email>>;

    /// Claim up to `limit` pending emails for this caller.
    ///
    /// Locks candidate rows with `FOR UPDATE SKIP LOCKED` and flips them to
    /// `processing` before the transaction commits, so concurrent claimers
    /// always receive disjoint sets.
    async fn claim_batch(&self, limit: i64) -> Result<Vec<Email>>;

    /// Mark an email sent with the given detail.
    ///
    /// Idempotent: `sent_at` is stamped only the first time, and an email
    /// already marked `read` keeps that status.
    async fn update_status(&self, id: i64, detail: &str) -> Result<()>;

    /// Refresh a claim the caller still holds.
    ///
    /// Compare-and-swap on `claimed_at`: succeeds only while the row is
    /// `processing` and stamped with `claimed_at`, and returns the new
    /// stamp. `None` means the claim was reclaimed or completed by someone
    /// else and the email must not be sent.
    async fn renew_claim(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Mark a claimed email sent.
    ///
    /// Applies only while the row is `processing` with the given
    /// `claimed_at`. Fails with [`crate::error::Error::ClaimLost`] when the
    /// claim has moved on, so a stale holder never counts a delivery twice.
    async fn complete_claim(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
        detail: &str,
    ) -> Result<()>;

    /// Return `processing` emails claimed longer than `lease` ago to
    /// `pending`. Returns how many rows were released.
    ///
    /// A run that still holds a released row finds out at its next
    /// [`renew_claim`](EmailStore::renew_claim) and skips it.
    async fn reclaim_stale(&self, lease: Duration) -> Result<u64>;

    /// Cheap liveness probe of the backing store.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Release underlying resources.
    async fn close(&self) -> Result<()>;
}
