//! A relay instance that claims a row and crashes before publishing must
//! not lose it: the next sweep has to reclaim and publish it exactly as if
//! it had never been claimed. This exercises that path end to end against
//! a real database with a fake transport standing in for PGMQ.

mod common;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use relaycore_orchestrator::OutboxRelay;
use relaycore_queue::{CommandQueue, QueuedCommand, ReceivedCommand, ReceivedValue};
use relaycore_shared::config::OutboxRelayConfig;
use relaycore_shared::db::{OutboxCategory, OutboxRow, OutboxStatus, OutboxStore};
use relaycore_shared::errors::PlatformResult;
use uuid::Uuid;

/// Records every destination it was asked to publish to; never fails, so
/// the test isolates the claim/reclaim behavior rather than dispatch
/// error handling (already covered by the reschedule tests in
/// `relaycore-shared`).
#[derive(Debug, Default)]
struct RecordingQueue {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandQueue for RecordingQueue {
    async fn ensure_queue(&self, _destination: &str) -> PlatformResult<()> {
        Ok(())
    }

    async fn send(&self, destination: &str, _command: &QueuedCommand) -> PlatformResult<i64> {
        self.sent.lock().unwrap().push(destination.to_string());
        Ok(1)
    }

    async fn send_value(&self, destination: &str, _value: &serde_json::Value) -> PlatformResult<i64> {
        self.sent.lock().unwrap().push(destination.to_string());
        Ok(1)
    }

    async fn receive(&self, _destination: &str, _visibility_timeout: Duration, _limit: i64) -> PlatformResult<Vec<ReceivedCommand>> {
        Ok(Vec::new())
    }

    async fn receive_values(&self, _destination: &str, _visibility_timeout: Duration, _limit: i64) -> PlatformResult<Vec<ReceivedValue>> {
        Ok(Vec::new())
    }

    async fn ack(&self, _destination: &str, _message_id: i64) -> PlatformResult<()> {
        Ok(())
    }

    async fn archive(&self, _destination: &str, _message_id: i64) -> PlatformResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> PlatformResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn a_row_stuck_sending_past_a_prior_crash_is_redelivered() {
    let pool = common::test_pool().await;
    let destination = format!("test.relay.{}", Uuid::now_v7());

    let id = {
        let mut conn = pool.acquire().await.unwrap();
        let id = OutboxStore::insert(&mut conn, OutboxCategory::Event, &destination, &serde_json::json!({"k": "v"}), &serde_json::json!({}))
            .await
            .unwrap();

        // A prior relay instance claimed this row and crashed before publishing.
        sqlx::query("UPDATE outbox SET status = 'SENDING', claimed_at = now() - interval '10 minutes' WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await
            .unwrap();
        id
    };

    let queue = std::sync::Arc::new(RecordingQueue::default());
    let config = OutboxRelayConfig {
        stale_lease_secs: 60,
        ..OutboxRelayConfig::default()
    };
    let relay = OutboxRelay::new(pool.clone(), queue.clone(), config);

    let dispatched = relay.sweep_once().await.unwrap();
    assert_eq!(dispatched, 1);
    assert_eq!(relay.metrics().snapshot().published, 1);
    assert_eq!(queue.sent.lock().unwrap().as_slice(), [destination.as_str()]);

    let mut conn = pool.acquire().await.unwrap();
    let row = sqlx::query_as::<_, OutboxRow>("SELECT * FROM outbox WHERE id = $1")
        .bind(id)
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(row.status, OutboxStatus::Published);
}
