//! Command bus / ingress gate (§4.E): the single place that turns a
//! `(name, idempotencyKey, businessKey, payload)` tuple into a durably
//! accepted command, by writing the command row and its outbox envelope
//! in one transaction.

use relaycore_shared::config::{QueueNamingConfig, ServerConfig};
use relaycore_shared::db::{CommandRow, CommandStore, OutboxCategory, OutboxStore};
use relaycore_shared::envelope::{header_keys, CommandEnvelope, Headers};
use relaycore_shared::errors::{PlatformError, PlatformResult};
use relaycore_shared::transaction;
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CommandBus {
    pool: PgPool,
    queue_naming: QueueNamingConfig,
    server: ServerConfig,
}

impl CommandBus {
    pub fn new(pool: PgPool, queue_naming: QueueNamingConfig, server: ServerConfig) -> Self {
        Self {
            pool,
            queue_naming,
            server,
        }
    }

    /// Submit a root command (no caller-supplied correlation id).
    #[instrument(skip(self, payload))]
    pub async fn submit(
        &self,
        name: &str,
        idempotency_key: &str,
        business_key: Option<&str>,
        payload: Value,
    ) -> PlatformResult<Uuid> {
        self.submit_correlated(name, idempotency_key, business_key, payload, None, Headers::new())
            .await
    }

    /// Submit a command as a saga step: `correlation_id` is the owning
    /// process id, threaded through the envelope and back on the reply
    /// (§4.L "Sequential step" / "Parallel step"). `extra_headers` carries
    /// platform-level metadata the caller needs echoed back on the reply
    /// (e.g. `parallelBranch` for a fan-out branch) without depending on
    /// handler cooperation — the executor echoes every header it receives.
    #[instrument(skip(self, payload))]
    pub async fn submit_correlated(
        &self,
        name: &str,
        idempotency_key: &str,
        business_key: Option<&str>,
        payload: Value,
        correlation_id: Option<Uuid>,
        extra_headers: Headers,
    ) -> PlatformResult<Uuid> {
        if let Some(existing) = CommandStore::find_by_idempotency_key(
            &mut *self.pool.acquire().await?,
            idempotency_key,
        )
        .await?
        {
            return self.handle_replay(existing);
        }

        let destination = self.queue_naming.command_destination(name);
        let mut headers = Headers::new();
        headers.insert(header_keys::IDEMPOTENCY_KEY.to_string(), idempotency_key.to_string());
        if let Some(key) = business_key {
            headers.insert(header_keys::BUSINESS_KEY.to_string(), key.to_string());
        }
        headers.extend(extra_headers);

        let command_id = transaction::run(&self.pool, |tx| {
            let headers = headers.clone();
            let name = name.to_string();
            let idempotency_key = idempotency_key.to_string();
            let business_key = business_key.map(str::to_string);
            Box::pin(async move {
                let command_id = CommandStore::save_pending(
                    &mut *tx,
                    &name,
                    &idempotency_key,
                    business_key.as_deref(),
                    &payload,
                    &serde_json::to_value(&headers).unwrap_or_default(),
                )
                .await?;

                let mut envelope = CommandEnvelope::new(command_id, name, payload);
                if let Some(correlation_id) = correlation_id {
                    envelope = envelope.with_correlation_id(correlation_id);
                }

                OutboxStore::insert(
                    &mut *tx,
                    OutboxCategory::Command,
                    &destination,
                    &serde_json::to_value(&envelope)?,
                    &serde_json::to_value(&headers)?,
                )
                .await?;

                Ok(command_id)
            })
        })
        .await?;

        Ok(command_id)
    }

    /// §4.E open question, resolved by [`ServerConfig::idempotent_replay_returns_existing`]:
    /// either return the already-accepted command id, or raise the
    /// conflict so ingress maps it to a 409.
    fn handle_replay(&self, existing: CommandRow) -> PlatformResult<Uuid> {
        if self.server.idempotent_replay_returns_existing {
            Ok(existing.id)
        } else {
            Err(PlatformError::DuplicateIdempotencyKey {
                key: existing.idempotency_key,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_policy_defaults_to_conflict() {
        let server = ServerConfig::default();
        assert!(!server.idempotent_replay_returns_existing);
    }
}
