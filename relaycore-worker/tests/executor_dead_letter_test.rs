//! End-to-end executor coverage against a real database: a handler that
//! rejects its payload outright must dead-letter on the first attempt (no
//! retry budget spent on a non-retryable error) and bump the dead-letter
//! counter, with a reply visible in the outbox for the relay to pick up.

mod common;

use common::fake_queue::NoopQueue;
use std::sync::Arc;

use relaycore_queue::{CommandQueue, QueuedCommand, ReceivedCommand};
use relaycore_shared::config::{ExecutorConfig, QueueNamingConfig, TopicNamingConfig};
use relaycore_shared::db::{CommandStatus, CommandStore, OutboxCategory};
use relaycore_shared::envelope::{CommandEnvelope, Headers};
use relaycore_shared::errors::PlatformError;
use relaycore_worker::{Executor, HandlerRegistry};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
struct RejectMeCommand {
    #[allow(dead_code)]
    reason: String,
}
impl relaycore_worker::DomainCommand for RejectMeCommand {}

#[tokio::test]
async fn a_validation_failure_dead_letters_without_retrying() {
    let pool = common::test_pool().await;

    let registry = HandlerRegistry::new();
    registry
        .register::<RejectMeCommand, _, _>(|cmd| async move { Err(PlatformError::HandlerValidationError(cmd.reason)) })
        .unwrap();
    let registry = Arc::new(registry);

    let queue: Arc<dyn CommandQueue> = Arc::new(NoopQueue::default());
    let executor = Executor::new(
        pool.clone(),
        queue,
        registry,
        QueueNamingConfig::default(),
        TopicNamingConfig::default(),
        ExecutorConfig::default(),
    );

    let idempotency_key = format!("test-{}", Uuid::now_v7());
    let command_id = {
        let mut conn = pool.acquire().await.unwrap();
        CommandStore::save_pending(
            &mut conn,
            "RejectMe",
            &idempotency_key,
            None,
            &serde_json::json!({"reason": "bad input"}),
            &serde_json::json!({}),
        )
        .await
        .unwrap()
    };

    let envelope = CommandEnvelope::new(command_id, "RejectMe", serde_json::json!({"reason": "bad input"}));
    let received = ReceivedCommand {
        message_id: fastrand::i64(1..=i64::MAX),
        read_count: 1,
        command: QueuedCommand { envelope, headers: Headers::new() },
    };

    executor.process("test.RejectMe.Q", received).await.unwrap();

    assert_eq!(executor.metrics().dead_lettered.get(), 1);

    let mut conn = pool.acquire().await.unwrap();
    let command = CommandStore::find_by_id(&mut conn, command_id).await.unwrap().unwrap();
    assert_eq!(command.status, CommandStatus::Failed);

    let reply: (serde_json::Value,) = sqlx::query_as(
        "SELECT payload FROM outbox WHERE category = $1 AND payload->>'command_id' = $2",
    )
    .bind(OutboxCategory::Reply)
    .bind(command_id.to_string())
    .fetch_one(&mut conn)
    .await
    .unwrap();
    assert_eq!(reply.0["status"], "FAILED");
}
