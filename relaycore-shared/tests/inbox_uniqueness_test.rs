//! The inbox dedupe gate's whole job is its `(message_id, handler)` unique
//! constraint; these tests exercise it against a real database instead of
//! trusting the migration file.

mod common;

use relaycore_shared::db::{InboxOutcome, InboxStore};
use uuid::Uuid;

#[tokio::test]
async fn second_insert_of_the_same_pair_is_a_duplicate() {
    let pool = common::test_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let message_id = fastrand::i64(1..=i64::MAX);
    let command_id = Uuid::now_v7();

    let first = InboxStore::try_insert(&mut conn, message_id, "CreateUser", command_id).await.unwrap();
    assert_eq!(first, InboxOutcome::Inserted);

    let second = InboxStore::try_insert(&mut conn, message_id, "CreateUser", command_id).await.unwrap();
    assert_eq!(second, InboxOutcome::Duplicate);

    let row = InboxStore::find(&mut conn, message_id, "CreateUser").await.unwrap();
    assert!(row.is_some());
}

#[tokio::test]
async fn same_message_id_different_handler_is_not_a_duplicate() {
    let pool = common::test_pool().await;
    let mut conn = pool.acquire().await.unwrap();
    let message_id = fastrand::i64(1..=i64::MAX);
    let command_id = Uuid::now_v7();

    let first = InboxStore::try_insert(&mut conn, message_id, "CreateUser", command_id).await.unwrap();
    let second = InboxStore::try_insert(&mut conn, message_id, "SendWelcomeEmail", command_id).await.unwrap();

    assert_eq!(first, InboxOutcome::Inserted);
    assert_eq!(second, InboxOutcome::Inserted);
}
