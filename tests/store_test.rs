//! Contract tests for the in-memory email store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mailpump::error::Error;
use mailpump::model::Status;
use mailpump::store::{EmailStore, MemoryStore};

#[tokio::test]
async fn fetch_batch_pages_pending_rows_in_id_order() {
    let store = MemoryStore::with_pending(7);
    store.set_status(2, Status::Sent).unwrap();

    let first = store.fetch_batch(3, 0).await.unwrap();
    let second = store.fetch_batch(3, 3).await.unwrap();
    let ids: Vec<i64> = first.iter().chain(&second).map(|e| e.id).collect();

    assert_eq!(ids, vec![1, 3, 4, 5, 6, 7]);
    // Plain reads do not change anything.
    assert_eq!(store.count_with_status(Status::Pending), 6);
}

#[tokio::test]
async fn claim_marks_rows_processing() {
    let store = MemoryStore::with_pending(5);

    let claimed = store.claim_batch(3).await.unwrap();

    assert_eq!(claimed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(claimed.iter().all(|e| e.status == Status::Processing));
    assert!(claimed.iter().all(|e| e.claimed_at.is_some()));
    assert_eq!(store.count_with_status(Status::Pending), 2);

    let rest = store.claim_batch(10).await.unwrap();
    assert_eq!(rest.len(), 2);
    assert!(store.claim_batch(10).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_disjoint() {
    let store = Arc::new(MemoryStore::with_pending(500));

    let claimers: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(9).await.unwrap();
                    if batch.is_empty() {
                        return mine;
                    }
                    mine.extend(batch.into_iter().map(|e| e.id));
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "email {id} claimed twice");
        }
    }
    assert_eq!(total, 500);
}

#[tokio::test]
async fn update_status_is_idempotent() {
    let store = MemoryStore::with_pending(1);

    store.update_status(1, "first").await.unwrap();
    let first = store.get(1).unwrap();
    store.update_status(1, "second").await.unwrap();
    let second = store.get(1).unwrap();

    assert_eq!(second.status, Status::Sent);
    assert_eq!(second.sent_at, first.sent_at, "sent_at is stamped once");
    assert_eq!(second.details.as_deref(), Some("second"));
}

#[tokio::test]
async fn update_status_keeps_read_emails_read() {
    let store = MemoryStore::with_pending(1);
    store.set_status(1, Status::Read).unwrap();

    store.update_status(1, "late delivery").await.unwrap();

    let email = store.get(1).unwrap();
    assert_eq!(email.status, Status::Read);
    assert!(email.sent_at.is_some());
}

#[tokio::test]
async fn update_status_rejects_failed_and_missing_rows() {
    let store = MemoryStore::with_pending(1);
    store.set_status(1, Status::Failed).unwrap();

    let err = store.update_status(1, "x").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let err = store.update_status(42, "x").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(42)));
}

#[tokio::test]
async fn reclaim_only_releases_expired_claims() {
    let store = MemoryStore::with_pending(3);
    store.claim_batch(3).await.unwrap();
    store.age_claim(1, Duration::from_secs(600)).unwrap();

    let released = store.reclaim_stale(Duration::from_secs(300)).await.unwrap();

    assert_eq!(released, 1);
    let email = store.get(1).unwrap();
    assert_eq!(email.status, Status::Pending);
    assert!(email.claimed_at.is_none());
    assert_eq!(store.count_with_status(Status::Processing), 2);
}

#[tokio::test]
async fn injected_fetch_failures_start_at_the_given_call() {
    let store = MemoryStore::with_pending(10);
    store.fail_fetches_from(2);

    assert_eq!(store.claim_batch(4).await.unwrap().len(), 4);
    assert!(store.claim_batch(4).await.is_err());
    assert!(store.fetch_batch(4, 0).await.is_err());
}

#[tokio::test]
async fn renew_claim_swaps_the_stamp_only_for_the_holder() {
    let store = MemoryStore::with_pending(1);
    let claimed = store.claim_batch(1).await.unwrap().remove(0);
    let stamp = claimed.claimed_at.unwrap();

    let renewed = store.renew_claim(1, stamp).await.unwrap().unwrap();
    assert!(renewed > stamp);
    assert_eq!(store.get(1).unwrap().claimed_at, Some(renewed));

    // The old stamp no longer identifies the holder.
    assert!(store.renew_claim(1, stamp).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_holder_cannot_complete_a_reclaimed_email() {
    let store = MemoryStore::with_pending(1);
    let stale = store.claim_batch(1).await.unwrap().remove(0);
    store.age_claim(1, Duration::from_secs(600)).unwrap();
    let aged = store.get(1).unwrap().claimed_at.unwrap();

    store.reclaim_stale(Duration::from_secs(300)).await.unwrap();
    let fresh = store.claim_batch(1).await.unwrap().remove(0);
    let fresh_stamp = fresh.claimed_at.unwrap();

    assert!(store.renew_claim(1, aged).await.unwrap().is_none());
    let err = store
        .complete_claim(1, stale.claimed_at.unwrap(), "stale")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClaimLost(1)));

    store.complete_claim(1, fresh_stamp, "fresh").await.unwrap();
    let email = store.get(1).unwrap();
    assert_eq!(email.status, Status::Sent);
    assert_eq!(email.details.as_deref(), Some("fresh"));

    // Completed rows stay completed for the stale holder too.
    let err = store.complete_claim(1, aged, "late").await.unwrap_err();
    assert!(matches!(err, Error::ClaimLost(1)));
}
