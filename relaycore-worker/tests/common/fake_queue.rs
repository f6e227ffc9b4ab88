//! A [`CommandQueue`] that never touches a real transport, for tests that
//! exercise the executor's database side effects in isolation from PGMQ.

use std::time::Duration;

use async_trait::async_trait;
use relaycore_queue::{CommandQueue, QueuedCommand, ReceivedCommand, ReceivedValue};
use relaycore_shared::errors::PlatformResult;

#[derive(Debug, Default)]
pub struct NoopQueue;

#[async_trait]
impl CommandQueue for NoopQueue {
    async fn ensure_queue(&self, _destination: &str) -> PlatformResult<()> {
        Ok(())
    }

    async fn send(&self, _destination: &str, _command: &QueuedCommand) -> PlatformResult<i64> {
        Ok(1)
    }

    async fn send_value(&self, _destination: &str, _value: &serde_json::Value) -> PlatformResult<i64> {
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
