//! The executor (§4.H): the loop that turns a delivered queue message into
//! exactly one domain effect, or a clean no-op on redelivery.
//!
//! `process` implements the algorithm verbatim:
//! 1. `inbox.tryInsert(messageId, handler)` — duplicate means a prior
//!    delivery already ran this handler; acknowledge and stop.
//! 2. `commandStore.markRunning(commandId, leaseUntil)`.
//! 3. Look up the handler by tag; missing means a permanent failure.
//! 4. Run the handler under a deadline equal to the lease, then apply
//!    exactly one of: success, no-handler, retryable failure (re-enqueued
//!    as a fresh outbox row so the inbox gate doesn't collide with itself),
//!    or exhausted-retries failure (dead-lettered).
//!
//! Every state transition and its outbox/DLQ side effects share one
//! transaction, so a crash between them can never leave the command
//! marked done without the reply (or vice versa).

use std::sync::Arc;
use std::time::Duration;

use relaycore_queue::{CommandQueue, QueuedCommand, ReceivedCommand};
use relaycore_shared::config::{ExecutorConfig, QueueNamingConfig, TopicNamingConfig};
use relaycore_shared::db::{CommandStore, DlqStore, InboxOutcome, InboxStore, OutboxCategory, OutboxStore};
use relaycore_shared::envelope::{header_keys, Headers, ReplyEnvelope};
use relaycore_shared::errors::PlatformError;
use relaycore_shared::metrics::Counter;
use relaycore_shared::transaction;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::registry::HandlerRegistry;

/// Dead-letter count this executor has produced, read by the binary at
/// shutdown (§7 "relay/executor metrics counters"; the worker has no HTTP
/// surface of its own, so this is logged rather than served).
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    pub dead_lettered: Counter,
}

/// Copy the `parallelBranch` header (if present) onto the reply's data map
/// so `ProcessManager` can route a parallel-branch reply correctly
/// regardless of what the handler itself returned — branch identity is
/// platform metadata, not something a handler should have to cooperate on
/// (§4.H, §4.L).
fn echo_parallel_branch(headers: &Headers, mut reply: ReplyEnvelope) -> ReplyEnvelope {
    if let Some(branch) = headers.get(header_keys::PARALLEL_BRANCH) {
        reply.data.insert(header_keys::PARALLEL_BRANCH.to_string(), serde_json::json!(branch));
    }
    reply
}

#[derive(Clone)]
pub struct Executor {
    pool: PgPool,
    queue: Arc<dyn CommandQueue>,
    registry: Arc<HandlerRegistry>,
    queue_naming: QueueNamingConfig,
    topic_naming: TopicNamingConfig,
    config: ExecutorConfig,
    metrics: Arc<ExecutorMetrics>,
}

impl Executor {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn CommandQueue>,
        registry: Arc<HandlerRegistry>,
        queue_naming: QueueNamingConfig,
        topic_naming: TopicNamingConfig,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            registry,
            queue_naming,
            topic_naming,
            config,
            metrics: Arc::new(ExecutorMetrics::default()),
        }
    }

    /// Shared handle to this executor's counters.
    pub fn metrics(&self) -> Arc<ExecutorMetrics> {
        self.metrics.clone()
    }

    /// Process one delivered message end to end (§4.H). Never returns an
    /// error for a handler failure — those are captured as command/outbox
    /// state. An `Err` here means the executor itself couldn't talk to
    /// Postgres or the queue, which the caller should treat as "leave this
    /// message unacked and try again."
    #[instrument(skip(self, received), fields(message_id = received.message_id))]
    pub async fn process(&self, destination: &str, received: ReceivedCommand) -> Result<(), PlatformError> {
        let envelope = &received.command.envelope;
        let handler_tag = envelope.command_type.clone();

        let inbox_outcome = InboxStore::try_insert(
            &mut *self.pool.acquire().await?,
            received.message_id,
            &handler_tag,
            envelope.command_id,
        )
        .await?;

        if inbox_outcome == InboxOutcome::Duplicate {
            info!(command_id = %envelope.command_id, "duplicate delivery, skipping handler");
            self.queue.ack(destination, received.message_id).await?;
            return Ok(());
        }

        let lease_until = chrono::Utc::now() + chrono::Duration::seconds(self.config.handler_timeout_secs as i64);
        CommandStore::mark_running(&mut *self.pool.acquire().await?, envelope.command_id, lease_until).await?;

        let handler = match self.registry.get(&handler_tag) {
            Some(handler) => handler,
            None => {
                self.fail_permanently(destination, &received, "no handler registered for this command type")
                    .await?;
                return Ok(());
            }
        };

        let remaining = (lease_until - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        let outcome = tokio::time::timeout(remaining, handler.handle(envelope.payload.clone())).await;

        match outcome {
            Ok(Ok(result)) => self.succeed(destination, &received, result).await,
            Ok(Err(error)) => self.handle_failure(destination, &received, error, false).await,
            Err(_) => {
                self.handle_failure(destination, &received, PlatformError::CommandLeaseExpired { command_id: envelope.command_id }, true)
                    .await
            }
        }
    }

    async fn succeed(
        &self,
        destination: &str,
        received: &ReceivedCommand,
        outcome: crate::registry::HandlerOutcome,
    ) -> Result<(), PlatformError> {
        let envelope = received.command.envelope.clone();
        let headers = received.command.headers.clone();
        let reply_destination = self.queue_naming.reply_queue.clone();
        let topic_naming = self.topic_naming.clone();

        transaction::run(&self.pool, move |tx| {
            let envelope = envelope.clone();
            let headers = headers.clone();
            let reply_destination = reply_destination.clone();
            let topic_naming = topic_naming.clone();
            Box::pin(async move {
                CommandStore::mark_succeeded(&mut *tx, envelope.command_id).await?;

                let reply = ReplyEnvelope::completed(envelope.command_id, envelope.correlation_id, outcome.data);
                let reply = echo_parallel_branch(&headers, reply);
                OutboxStore::insert(
                    &mut *tx,
                    OutboxCategory::Reply,
                    &reply_destination,
                    &serde_json::to_value(&reply)?,
                    &serde_json::json!({}),
                )
                .await?;

                for event in &outcome.events {
                    OutboxStore::insert(
                        &mut *tx,
                        OutboxCategory::Event,
                        &topic_naming.event_topic(&event.event_type),
                        &event.payload,
                        &serde_json::json!({}),
                    )
                    .await?;
                }

                Ok(())
            })
        })
        .await?;

        self.queue.ack(destination, received.message_id).await?;
        Ok(())
    }

    /// A no-handler condition is permanent by definition: no amount of
    /// retrying resolves a command type nothing is registered for.
    async fn fail_permanently(&self, destination: &str, received: &ReceivedCommand, reason: &str) -> Result<(), PlatformError> {
        self.dead_letter(destination, received, reason, 0).await
    }

    async fn handle_failure(
        &self,
        destination: &str,
        received: &ReceivedCommand,
        error: PlatformError,
        is_timeout: bool,
    ) -> Result<(), PlatformError> {
        let envelope = &received.command.envelope;
        let command = CommandStore::find_by_id(&mut *self.pool.acquire().await?, envelope.command_id)
            .await?
            .ok_or(PlatformError::CommandNotFound(envelope.command_id))?;

        let retryable = !is_timeout && error.is_retryable_by_default();
        let budget_left = command.retries < self.config.max_retries as i32;

        if (retryable || is_timeout) && budget_left {
            self.retry(destination, received, &error, is_timeout).await
        } else {
            self.dead_letter(destination, received, &error.to_string(), command.retries).await
        }
    }

    /// Mark this attempt FAILED/TIMED_OUT, bump the retry counter, and
    /// re-enqueue a fresh outbox `command` row carrying the same
    /// `commandId`/payload. A fresh row gets a fresh `message_id`, so the
    /// inbox gate on the next delivery does not collide with the attempt
    /// being retried (§4.H note on redelivery vs re-enqueue).
    async fn retry(
        &self,
        destination: &str,
        received: &ReceivedCommand,
        error: &PlatformError,
        is_timeout: bool,
    ) -> Result<(), PlatformError> {
        let envelope = received.command.envelope.clone();
        let headers = received.command.headers.clone();
        let command_destination = self.queue_naming.command_destination(&envelope.command_type);
        let error_message = error.to_string();

        transaction::run(&self.pool, move |tx| {
            let envelope = envelope.clone();
            let headers = headers.clone();
            let command_destination = command_destination.clone();
            let error_message = error_message.clone();
            Box::pin(async move {
                if is_timeout {
                    CommandStore::mark_timed_out(&mut *tx, envelope.command_id).await?;
                } else {
                    CommandStore::mark_failed(&mut *tx, envelope.command_id, &error_message).await?;
                }
                CommandStore::bump_retry(&mut *tx, envelope.command_id).await?;

                let requeued = QueuedCommand { envelope: envelope.clone(), headers };
                OutboxStore::insert(
                    &mut *tx,
                    OutboxCategory::Command,
                    &command_destination,
                    &serde_json::to_value(&requeued.envelope)?,
                    &serde_json::to_value(&requeued.headers)?,
                )
                .await?;
                Ok(())
            })
        })
        .await?;

        warn!(command_id = %received.command.envelope.command_id, "command attempt failed, re-enqueued for retry");
        self.queue.ack(destination, received.message_id).await?;
        Ok(())
    }

    async fn dead_letter(&self, destination: &str, received: &ReceivedCommand, reason: &str, attempts: i32) -> Result<(), PlatformError> {
        let envelope = received.command.envelope.clone();
        let headers = received.command.headers.clone();
        let message_id = received.message_id;
        let reply_destination = self.queue_naming.reply_queue.clone();
        let reason = reason.to_string();
        let log_reason = reason.clone();

        transaction::run(&self.pool, move |tx| {
            let envelope = envelope.clone();
            let headers = headers.clone();
            let reply_destination = reply_destination.clone();
            let reason = reason.clone();
            Box::pin(async move {
                CommandStore::mark_failed(&mut *tx, envelope.command_id, &reason).await?;
                DlqStore::insert(
                    &mut *tx,
                    envelope.command_id,
                    message_id,
                    &envelope.command_type,
                    &envelope.payload,
                    &reason,
                    attempts,
                )
                .await?;

                let reply = ReplyEnvelope::failed(envelope.command_id, envelope.correlation_id, reason.clone());
                let reply = echo_parallel_branch(&headers, reply);
                OutboxStore::insert(
                    &mut *tx,
                    OutboxCategory::Reply,
                    &reply_destination,
                    &serde_json::to_value(&reply)?,
                    &serde_json::json!({}),
                )
                .await?;
                Ok(())
            })
        })
        .await?;

        self.metrics.dead_lettered.incr();
        warn!(command_id = %received.command.envelope.command_id, reason = log_reason, "command dead-lettered");
        self.queue.ack(destination, received.message_id).await?;
        Ok(())
    }
}

/// Poll a single destination forever, processing messages with up to
/// `concurrency` handler invocations in flight at once (§5 "Concurrency &
/// Resource Model": bounded per-destination parallelism, not a global
/// thread pool).
#[instrument(skip(executor))]
pub async fn run_consumer(executor: Executor, destination: String, concurrency: u32, visibility_timeout: Duration) {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency as usize));
    loop {
        let batch = match executor.queue.receive(&destination, visibility_timeout, concurrency as i64).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(%destination, error = %e, "receive failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(250)).await;
            continue;
        }

        let mut joins = Vec::with_capacity(batch.len());
        for received in batch {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let executor = executor.clone();
            let destination = destination.clone();
            joins.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = executor.process(&destination, received).await {
                    warn!(%destination, error = %e, "executor processing failed, message left unacked for redelivery");
                }
            }));
        }
        for join in joins {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_lease_duration_never_goes_negative_after_timeout_classification() {
        let lease_until = chrono::Utc::now() - chrono::Duration::seconds(5);
        let remaining = (lease_until - chrono::Utc::now()).to_std().unwrap_or(Duration::from_secs(0));
        assert_eq!(remaining, Duration::from_secs(0));
    }
}
