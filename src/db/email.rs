//! Email row operations: paging, lock-skip claiming, status updates.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Email, Status};
use crate::store::EmailStore;
use crate::telemetry::metrics;

const EMAIL_COLUMNS: &str = "id, email, status, sent_at, details, claimed_at, created_at";

impl super::Db {
    /// Insert `count` pending emails addressed `user{n}@{domain}`.
    /// Returns the ids of the inserted rows.
    pub async fn insert_pending(&self, count: i64, domain: &str) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "INSERT INTO emails (email, status)
             SELECT 'user' || n || '@' || $2, 'pending'
             FROM generate_series(1, $1) AS n
             RETURNING id",
        )
        .bind(count)
        .bind(domain)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Get an email by id.
    pub async fn get_email(&self, id: i64) -> Result<Email> {
        let row: Option<Email> =
            sqlx::query_as(&format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = $1"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        row.ok_or(Error::NotFound(id))
    }

    /// Row counts per status, in [`Status::ALL`] order. Missing statuses count zero.
    pub async fn status_counts(&self) -> Result<Vec<(Status, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM emails GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts: Vec<(Status, i64)> = Status::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, n) in rows {
            let status: Status = status.parse()?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = n;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl EmailStore for super::Db {
    async fn fetch_batch(&self, limit: i64, offset: i64) -> Result<Vec<Email>> {
        let emails: Vec<Email> = sqlx::query_as(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE status = 'pending'
             ORDER BY id
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(emails)
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<Email>> {
        let mut tx = self.pool().begin().await?;

        // Rows locked by another in-flight claim are skipped, not waited on.
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM emails
             WHERE status = 'pending'
             ORDER BY id
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        // The status flip is the commitment. The lock alone only lasts
        // until commit.
        let mut emails: Vec<Email> = sqlx::query_as(&format!(
            "UPDATE emails
             SET status = 'processing', claimed_at = now()
             WHERE id = ANY($1)
             RETURNING {EMAIL_COLUMNS}"
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // RETURNING order is unspecified.
        emails.sort_by_key(|e| e.id);

        metrics::emails_claimed().add(emails.len() as u64, &[]);
        debug!(count = emails.len(), "claimed emails");
        Ok(emails)
    }

    async fn update_status(&self, id: i64, detail: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE emails
             SET status = CASE WHEN status = 'read' THEN status ELSE 'sent' END,
                 sent_at = COALESCE(sent_at, now()),
                 details = $2
             WHERE id = $1 AND status <> 'failed'",
        )
        .bind(id)
        .bind(detail)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Either the row is gone or it was failed out from under us.
            let email = self.get_email(id).await?;
            return Err(Error::InvalidTransition {
                from: email.status.to_string(),
                to: Status::Sent.to_string(),
            });
        }

        Ok(())
    }

    async fn renew_claim(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        // The new stamp must differ from the old one.
        let renewed: Option<DateTime<Utc>> = sqlx::query_scalar(
            "UPDATE emails
             SET claimed_at = clock_timestamp()
             WHERE id = $1 AND status = 'processing' AND claimed_at = $2
             RETURNING claimed_at",
        )
        .bind(id)
        .bind(claimed_at)
        .fetch_optional(self.pool())
        .await?;

        if renewed.is_none() {
            debug!(email_id = id, "claim no longer held");
        }
        Ok(renewed)
    }

    async fn complete_claim(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
        detail: &str,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE emails
             SET status = 'sent',
                 sent_at = COALESCE(sent_at, now()),
                 details = $3
             WHERE id = $1 AND status = 'processing' AND claimed_at = $2",
        )
        .bind(id)
        .bind(claimed_at)
        .bind(detail)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Surface NotFound for a vanished row, ClaimLost otherwise.
            self.get_email(id).await?;
            return Err(Error::ClaimLost(id));
        }

        Ok(())
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<u64> {
        let released = sqlx::query(
            "UPDATE emails
             SET status = 'pending', claimed_at = NULL
             WHERE status = 'processing'
               AND claimed_at < now() - make_interval(secs => $1)",
        )
        .bind(lease.as_secs_f64())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(released)
    }

    async fn ping(&self) -> Result<()> {
        self.health_check().await
    }

    async fn close(&self) -> Result<()> {
        self.pool().close().await;
        Ok(())
    }
}
