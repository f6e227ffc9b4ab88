//! Reply consumer (§4.F, §4.L): drains the single reply queue every
//! command and saga step answers on, and routes each reply to the
//! process manager when it carries a correlation id.
//!
//! A root command's reply (no correlation id) is informational only — the
//! executor already updated `command` in the same transaction that
//! produced the reply — so this consumer just acknowledges and drops it.

use std::sync::Arc;
use std::time::Duration;

use relaycore_queue::{CommandQueue, ReceivedValue};
use relaycore_shared::envelope::ReplyEnvelope;
use tracing::{info, instrument, warn};

use crate::process::ProcessManager;

#[derive(Clone)]
pub struct ReplyConsumer {
    queue: Arc<dyn CommandQueue>,
    manager: ProcessManager,
    destination: String,
}

impl ReplyConsumer {
    pub fn new(queue: Arc<dyn CommandQueue>, manager: ProcessManager, destination: String) -> Self {
        Self { queue, manager, destination }
    }

    /// Poll the reply queue forever. Errors talking to Postgres or the
    /// queue back off and retry; a reply that fails to route is logged
    /// and left unacked so the next poll retries it.
    pub async fn run(&self, concurrency: u32, visibility_timeout: Duration) {
        if let Err(e) = self.queue.ensure_queue(&self.destination).await {
            warn!(error = %e, "failed to ensure reply queue exists, retrying on first receive");
        }

        loop {
            let batch = match self
                .queue
                .receive_values(&self.destination, visibility_timeout, concurrency as i64)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "reply receive failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }

            for received in batch {
                self.handle(received).await;
            }
        }
    }

    #[instrument(skip(self, received), fields(message_id = received.message_id))]
    async fn handle(&self, received: ReceivedValue) {
        let reply: ReplyEnvelope = match serde_json::from_value(received.value) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "malformed reply message, acking to drop it");
                let _ = self.queue.ack(&self.destination, received.message_id).await;
                return;
            }
        };

        let Some(process_id) = reply.correlation_id else {
            info!(command_id = %reply.command_id, "root command reply, nothing to route");
            let _ = self.queue.ack(&self.destination, received.message_id).await;
            return;
        };

        match self.manager.handle_reply(process_id, reply).await {
            Ok(()) => {
                let _ = self.queue.ack(&self.destination, received.message_id).await;
            }
            Err(e) => {
                warn!(%process_id, error = %e, "failed to route reply, left unacked for redelivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_command_replies_carry_no_correlation_id() {
        let reply = ReplyEnvelope::completed(uuid::Uuid::nil(), None, Default::default());
        assert!(reply.correlation_id.is_none());
    }
}
