//! In-process email store.
//!
//! Holds rows in a `BTreeMap` behind a mutex. A claim takes the lock, picks
//! pending rows and flips them to `processing` in one critical section,
//! which gives the same disjointness guarantee the Postgres claim does.
//! Failures can be injected per email id or per fetch call.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::model::{Email, Status};

use super::EmailStore;

#[derive(Default)]
struct Inner {
    rows: BTreeMap<i64, Email>,
    failing_updates: HashSet<i64>,
    /// Fail every fetch/claim call whose 1-based index is >= this.
    fail_fetch_from: Option<u64>,
}

/// Email store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fetch_calls: AtomicU64,
    update_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding `count` pending emails with ids `1..=count`.
    pub fn with_pending(count: i64) -> Self {
        let store = Self::new();
        store.insert_pending(count);
        store
    }

    /// Append `count` pending emails after the current highest id.
    pub fn insert_pending(&self, count: i64) -> Vec<i64> {
        let mut inner = self.inner.lock();
        let start = inner.rows.keys().next_back().copied().unwrap_or(0) + 1;
        let ids: Vec<i64> = (start..start + count).collect();
        for id in &ids {
            inner
                .rows
                .insert(*id, Email::pending(*id, format!("user{id}@example.com")));
        }
        ids
    }

    /// Make `update_status` fail for these ids.
    pub fn fail_updates_for(&self, ids: impl IntoIterator<Item = i64>) {
        self.inner.lock().failing_updates.extend(ids);
    }

    /// Make the `n`th fetch or claim call (1-based) and every later one fail.
    pub fn fail_fetches_from(&self, n: u64) {
        self.inner.lock().fail_fetch_from = Some(n);
    }

    /// Snapshot of one row.
    pub fn get(&self, id: i64) -> Option<Email> {
        self.inner.lock().rows.get(&id).cloned()
    }

    /// Number of rows currently in `status`.
    pub fn count_with_status(&self, status: Status) -> usize {
        self.inner
            .lock()
            .rows
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    /// Overwrite a row's status directly.
    pub fn set_status(&self, id: i64, status: Status) -> Result<()> {
        let mut inner = self.inner.lock();
        let email = inner.rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        email.status = status;
        Ok(())
    }

    /// Backdate a claim, as if it happened `age` ago.
    pub fn age_claim(&self, id: i64, age: Duration) -> Result<()> {
        let age = chrono::Duration::from_std(age).map_err(|e| Error::Other(e.to_string()))?;
        let mut inner = self.inner.lock();
        let email = inner.rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        email.claimed_at = email.claimed_at.map(|t| t - age);
        Ok(())
    }

    /// How many `update_status` and `complete_claim` calls were made,
    /// successful or not.
    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::Relaxed)
    }

    fn check_fetch_failure(&self, inner: &Inner) -> Result<()> {
        let call = self.fetch_calls.fetch_add(1, Ordering::Relaxed) + 1;
        match inner.fail_fetch_from {
            Some(n) if call >= n => Err(Error::Other(format!("injected fetch failure on call {call}"))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EmailStore for MemoryStore {
    async fn fetch_batch(&self, limit: i64, offset: i64) -> Result<Vec<Email>> {
        let inner = self.inner.lock();
        self.check_fetch_failure(&inner)?;
        Ok(inner
            .rows
            .values()
            .filter(|e| e.status == Status::Pending)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<Email>> {
        let mut inner = self.inner.lock();
        self.check_fetch_failure(&inner)?;
        let now = Utc::now();
        let claimed: Vec<Email> = inner
            .rows
            .values_mut()
            .filter(|e| e.status == Status::Pending)
            .take(limit.max(0) as usize)
            .map(|e| {
                e.status = Status::Processing;
                e.claimed_at = Some(now);
                e.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn update_status(&self, id: i64, detail: &str) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.failing_updates.contains(&id) {
            return Err(Error::Other(format!("injected update failure for email {id}")));
        }
        let email = inner.rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        if email.status == Status::Failed {
            return Err(Error::InvalidTransition {
                from: email.status.to_string(),
                to: Status::Sent.to_string(),
            });
        }
        if email.status != Status::Read {
            email.status = Status::Sent;
        }
        email.sent_at.get_or_insert_with(Utc::now);
        email.details = Some(detail.to_string());
        Ok(())
    }

    async fn renew_claim(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut inner = self.inner.lock();
        let email = inner.rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        if email.status != Status::Processing || email.claimed_at != Some(claimed_at) {
            return Ok(None);
        }
        let renewed = Utc::now().max(claimed_at + TimeDelta::microseconds(1));
        email.claimed_at = Some(renewed);
        Ok(Some(renewed))
    }

    async fn complete_claim(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
        detail: &str,
    ) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.failing_updates.contains(&id) {
            return Err(Error::Other(format!("injected update failure for email {id}")));
        }
        let email = inner.rows.get_mut(&id).ok_or(Error::NotFound(id))?;
        if email.status != Status::Processing || email.claimed_at != Some(claimed_at) {
            return Err(Error::ClaimLost(id));
        }
        email.status = Status::Sent;
        email.sent_at.get_or_insert_with(Utc::now);
        email.details = Some(detail.to_string());
        Ok(())
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<u64> {
        let lease = chrono::Duration::from_std(lease).map_err(|e| Error::Other(e.to_string()))?;
        let cutoff = Utc::now() - lease;
        let mut inner = self.inner.lock();
        let mut released = 0;
        for email in inner.rows.values_mut() {
            if email.status == Status::Processing && email.claimed_at.is_some_and(|t| t < cutoff) {
                email.status = Status::Pending;
                email.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
