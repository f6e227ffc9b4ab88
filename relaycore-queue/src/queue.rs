//! PGMQ-backed [`CommandQueue`] (§4.E, §4.H): command envelopes are sent
//! as JSON messages on a per-command-name queue named by
//! [`relaycore_shared::config::QueueNamingConfig`], and consumed with
//! PGMQ's visibility-timeout semantics — a read message is invisible to
//! other readers until `ack`ed or the timeout lapses, which is what makes
//! redelivery on a crashed consumer free.

use std::time::Duration;

use async_trait::async_trait;
use relaycore_shared::envelope::{CommandEnvelope, Headers};
use relaycore_shared::errors::{PlatformError, PlatformResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// What actually travels on the wire: the envelope plus the conventional
/// headers (§6) that carry idempotency/correlation metadata PGMQ itself
/// has no concept of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub envelope: CommandEnvelope,
    #[serde(default)]
    pub headers: Headers,
}

/// A message read off a queue, still holding its PGMQ id so the caller
/// can `ack` (delete) or let the visibility timeout expire for redelivery.
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub message_id: i64,
    pub read_count: i32,
    pub command: QueuedCommand,
}

/// A message read off a reply or event queue, where the body is a bare
/// JSON value (a `ReplyEnvelope` or a domain-event payload) rather than a
/// [`QueuedCommand`].
#[derive(Debug, Clone)]
pub struct ReceivedValue {
    pub message_id: i64,
    pub read_count: i32,
    pub value: serde_json::Value,
}

/// The seam the orchestrator (producer) and worker (consumer) program
/// against, so neither depends on the `pgmq` crate's API shape directly.
#[async_trait]
pub trait CommandQueue: Send + Sync + std::fmt::Debug {
    async fn ensure_queue(&self, destination: &str) -> PlatformResult<()>;
    async fn send(&self, destination: &str, command: &QueuedCommand) -> PlatformResult<i64>;
    /// Send an arbitrary JSON value rather than a [`QueuedCommand`] — used
    /// for reply and event outbox rows, which carry a `ReplyEnvelope` or a
    /// bare domain-event payload instead of a command envelope.
    async fn send_value(&self, destination: &str, value: &serde_json::Value) -> PlatformResult<i64>;
    async fn receive(
        &self,
        destination: &str,
        visibility_timeout: Duration,
        limit: i64,
    ) -> PlatformResult<Vec<ReceivedCommand>>;
    /// Same as `receive`, but for queues carrying bare JSON (replies,
    /// events) instead of a [`QueuedCommand`] envelope.
    async fn receive_values(
        &self,
        destination: &str,
        visibility_timeout: Duration,
        limit: i64,
    ) -> PlatformResult<Vec<ReceivedValue>>;
    /// Permanently remove a successfully processed message.
    async fn ack(&self, destination: &str, message_id: i64) -> PlatformResult<()>;
    /// Move a message to PGMQ's archive table instead of deleting it —
    /// used for messages the executor gave up on (already in the DLQ).
    async fn archive(&self, destination: &str, message_id: i64) -> PlatformResult<()>;
    /// Probe the producer's own connection independently of any other
    /// pool the caller might be checking (§6 health endpoint).
    async fn health_check(&self) -> PlatformResult<()>;
}

#[derive(Clone)]
pub struct PgmqCommandQueue {
    queue: pgmq::PGMQueue,
    pool: sqlx::PgPool,
}

impl std::fmt::Debug for PgmqCommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgmqCommandQueue").finish_non_exhaustive()
    }
}

impl PgmqCommandQueue {
    pub async fn new(database_url: &str) -> PlatformResult<Self> {
        let pool = sqlx::PgPool::connect(database_url).await?;
        Ok(Self::new_with_pool(pool).await)
    }

    pub async fn new_with_pool(pool: sqlx::PgPool) -> Self {
        Self {
            queue: pgmq::PGMQueue::new_with_pool(pool.clone()).await,
            pool,
        }
    }

    /// The pool backing this queue, shared with [`crate::listener::QueueNotifier`]
    /// so the LISTEN connection and the PGMQ tables live against the same database.
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

/// Destination names follow the `<PREFIX><NAME><SUFFIX>` convention
/// (§4.E, §6), e.g. `APP.CMD.CREATEUSER.Q` or `events.UserCreated` — both
/// contain `.`, which PGMQ's underlying table-name derivation rejects.
/// Queue identifiers sent to PGMQ are sanitized; the original destination
/// string is preserved everywhere else (outbox rows, headers, logs) so
/// operators still see the documented convention.
pub(crate) fn pgmq_identifier(destination: &str) -> String {
    destination
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase()
}

#[async_trait]
impl CommandQueue for PgmqCommandQueue {
    #[instrument(skip(self))]
    async fn ensure_queue(&self, destination: &str) -> PlatformResult<()> {
        self.queue
            .create(&pgmq_identifier(destination))
            .await
            .map_err(|e| PlatformError::Messaging(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, command))]
    async fn send(&self, destination: &str, command: &QueuedCommand) -> PlatformResult<i64> {
        let message_id = self
            .queue
            .send(&pgmq_identifier(destination), command)
            .await
            .map_err(|e| PlatformError::Messaging(e.to_string()))?;
        debug!(message_id, destination, "enqueued command");
        Ok(message_id)
    }

    #[instrument(skip(self, value))]
    async fn send_value(&self, destination: &str, value: &serde_json::Value) -> PlatformResult<i64> {
        let message_id = self
            .queue
            .send(&pgmq_identifier(destination), value)
            .await
            .map_err(|e| PlatformError::Messaging(e.to_string()))?;
        debug!(message_id, destination, "enqueued value");
        Ok(message_id)
    }

    #[instrument(skip(self))]
    async fn receive(
        &self,
        destination: &str,
        visibility_timeout: Duration,
        limit: i64,
    ) -> PlatformResult<Vec<ReceivedCommand>> {
        let vt = visibility_timeout.as_secs() as i32;
        let batch = self
            .queue
            .read_batch::<QueuedCommand>(&pgmq_identifier(destination), Some(vt), limit.try_into().unwrap())
            .await
            .map_err(|e| PlatformError::Messaging(e.to_string()))?
            .unwrap_or_default();

        Ok(batch
            .into_iter()
            .map(|m| ReceivedCommand {
                message_id: m.msg_id,
                read_count: m.read_ct,
                command: m.message,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn receive_values(
        &self,
        destination: &str,
        visibility_timeout: Duration,
        limit: i64,
    ) -> PlatformResult<Vec<ReceivedValue>> {
        let vt = visibility_timeout.as_secs() as i32;
        let batch = self
            .queue
            .read_batch::<serde_json::Value>(&pgmq_identifier(destination), Some(vt), limit.try_into().unwrap())
            .await
            .map_err(|e| PlatformError::Messaging(e.to_string()))?
            .unwrap_or_default();

        Ok(batch
            .into_iter()
            .map(|m| ReceivedValue {
                message_id: m.msg_id,
                read_count: m.read_ct,
                value: m.message,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn ack(&self, destination: &str, message_id: i64) -> PlatformResult<()> {
        let deleted = self
            .queue
            .delete(&pgmq_identifier(destination), message_id)
            .await
            .map_err(|e| PlatformError::Messaging(e.to_string()))?;
        if deleted == 0 {
            warn!(message_id, destination, "ack deleted nothing; already acked or never existed");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn archive(&self, destination: &str, message_id: i64) -> PlatformResult<()> {
        self.queue
            .archive(&pgmq_identifier(destination), message_id)
            .await
            .map_err(|e| PlatformError::Messaging(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> PlatformResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod identifier_tests {
    use super::pgmq_identifier;

    #[test]
    fn sanitizes_dotted_destination_names() {
        assert_eq!(pgmq_identifier("APP.CMD.CREATEUSER.Q"), "app_cmd_createuser_q");
        assert_eq!(pgmq_identifier("events.UserCreated"), "events_usercreated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn queued_command_round_trips_through_json() {
        let command = QueuedCommand {
            envelope: CommandEnvelope::new(Uuid::nil(), "CreateUser", serde_json::json!({"username": "u1"})),
            headers: Headers::new(),
        };
        let json = serde_json::to_string(&command).unwrap();
        let parsed: QueuedCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.envelope, command.envelope);
    }
}
