//! Exercises the outbox claim path against a real database: concurrent
//! claimants must not double-claim a row, a row stuck in SENDING past the
//! stale window must come back, and a rescheduled row must carry its
//! failure reason.

mod common;

use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, Utc};
use relaycore_shared::db::{OutboxCategory, OutboxRow, OutboxStatus, OutboxStore};
use uuid::Uuid;

#[tokio::test]
async fn concurrent_claimants_never_see_the_same_row() {
    let pool = common::test_pool().await;
    let destination = format!("test.claim.{}", Uuid::now_v7());

    {
        let mut conn = pool.acquire().await.unwrap();
        for _ in 0..6 {
            OutboxStore::insert(&mut conn, OutboxCategory::Event, &destination, &serde_json::json!({}), &serde_json::json!({}))
                .await
                .unwrap();
        }
    }

    let claim = |limit: i64| {
        let pool = pool.clone();
        async move {
            let mut conn = pool.acquire().await.unwrap();
            OutboxStore::claim_batch(&mut conn, limit, ChronoDuration::seconds(30)).await.unwrap()
        }
    };

    let (first, second) = tokio::join!(claim(3), claim(3));
    let first_ids: HashSet<_> = first.iter().map(|r| r.id).collect();
    let second_ids: HashSet<_> = second.iter().map(|r| r.id).collect();

    assert!(first_ids.is_disjoint(&second_ids), "SKIP LOCKED should make the two claims disjoint");
    assert_eq!(first_ids.len() + second_ids.len(), 6);
}

#[tokio::test]
async fn stale_sending_rows_are_reclaimed() {
    let pool = common::test_pool().await;
    let destination = format!("test.stale.{}", Uuid::now_v7());
    let mut conn = pool.acquire().await.unwrap();

    let id = OutboxStore::insert(&mut conn, OutboxCategory::Event, &destination, &serde_json::json!({}), &serde_json::json!({}))
        .await
        .unwrap();

    // A prior relay instance claimed the row and crashed before publishing.
    sqlx::query("UPDATE outbox SET status = 'SENDING', claimed_at = now() - interval '10 minutes' WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .unwrap();

    let reclaimed = OutboxStore::claim_batch(&mut conn, 10, ChronoDuration::seconds(60)).await.unwrap();
    assert!(reclaimed.iter().any(|r| r.id == id));
}

#[tokio::test]
async fn reschedule_persists_the_failure_reason() {
    let pool = common::test_pool().await;
    let destination = format!("test.reschedule.{}", Uuid::now_v7());
    let mut conn = pool.acquire().await.unwrap();

    let id = OutboxStore::insert(&mut conn, OutboxCategory::Event, &destination, &serde_json::json!({}), &serde_json::json!({}))
        .await
        .unwrap();
    let claimed = OutboxStore::claim_batch(&mut conn, 10, ChronoDuration::seconds(30)).await.unwrap();
    assert!(claimed.iter().any(|r| r.id == id));

    OutboxStore::reschedule(&mut conn, id, Utc::now(), "connection refused").await.unwrap();

    let row = sqlx::query_as::<_, OutboxRow>("SELECT * FROM outbox WHERE id = $1")
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(row.status, OutboxStatus::New);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error.as_deref(), Some("connection refused"));
}
