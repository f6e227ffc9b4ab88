//! A single shared `PgListener` multiplexed across every queue a worker
//! consumes from, rather than one LISTEN connection per queue.
//!
//! A background task owns the one `PgListener` connection and
//! `tokio::select!`s between
//! incoming Postgres notifications and control commands from its callers,
//! fanning each notification out to the subscribers registered for that
//! channel. PGMQ does not emit NOTIFY itself, so callers are expected to
//! `pg_notify` a `cmdq.<destination>` channel from the same transaction
//! that writes the outbox row feeding that queue (§4.G) — this listener
//! only does the fan-out, not the triggering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 128;
const NOTIFICATION_BUFFER: usize = 64;

#[derive(Debug)]
enum ListenerCommand {
    AddChannel(String),
    AddSubscriber {
        channel: String,
        tx: mpsc::Sender<()>,
    },
}

struct NotifierState {
    pool: PgPool,
    command_tx: mpsc::Sender<ListenerCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<ListenerCommand>>>,
    started: AtomicBool,
}

/// Handle to the shared listener; cheap to clone, all clones share one
/// background task and one Postgres connection.
#[derive(Clone)]
pub struct QueueNotifier {
    inner: Arc<NotifierState>,
}

impl std::fmt::Debug for QueueNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueNotifier")
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl QueueNotifier {
    pub fn new(pool: PgPool) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            inner: Arc::new(NotifierState {
                pool,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                started: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_started(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let command_rx = self
                .inner
                .command_rx
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
                .expect("command_rx taken exactly once");
            let pool = self.inner.pool.clone();
            tokio::spawn(async move {
                listener_task(pool, command_rx).await;
            });
        }
    }

    /// Subscribe to wake-up signals for `destination`. A signal means
    /// "there may be new work"; the caller still does a normal PGMQ read
    /// to fetch it (the channel carries no payload, just a nudge).
    pub fn subscribe(&self, destination: &str) -> mpsc::Receiver<()> {
        self.ensure_started();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let channel = notify_channel(destination);
        if let Err(e) = self
            .inner
            .command_tx
            .try_send(ListenerCommand::AddChannel(channel.clone()))
        {
            warn!(destination, error = %e, "failed to register listen channel");
        }
        if let Err(e) = self
            .inner
            .command_tx
            .try_send(ListenerCommand::AddSubscriber { channel, tx })
        {
            warn!(destination, error = %e, "failed to register subscriber");
        }
        rx
    }
}

/// `cmdq_<destination>` keeps RelayCore's NOTIFY channels namespaced away
/// from any other LISTEN traffic on the same database, using the same
/// identifier sanitization as the queue names themselves.
fn notify_channel(destination: &str) -> String {
    format!("cmdq_{}", crate::queue::pgmq_identifier(destination))
}

async fn listener_task(pool: PgPool, mut command_rx: mpsc::Receiver<ListenerCommand>) {
    use sqlx::postgres::PgListener;

    let mut listener = match PgListener::connect_with(&pool).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to start shared queue listener");
            return;
        }
    };

    info!("shared queue listener started");
    let mut subscribers: HashMap<String, Vec<mpsc::Sender<()>>> = HashMap::new();

    loop {
        tokio::select! {
            notification = listener.recv() => {
                match notification {
                    Ok(notification) => {
                        let channel = notification.channel();
                        if let Some(txs) = subscribers.get_mut(channel) {
                            txs.retain(|tx| tx.try_send(()).is_ok() || !tx.is_closed());
                            debug!(channel, subscribers = txs.len(), "fanned out queue notification");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "shared queue listener connection error, stopping");
                        return;
                    }
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(ListenerCommand::AddChannel(channel)) => {
                        if let Err(e) = listener.listen(&channel).await {
                            error!(channel, error = %e, "failed to LISTEN on channel");
                        }
                    }
                    Some(ListenerCommand::AddSubscriber { channel, tx }) => {
                        subscribers.entry(channel).or_default().push(tx);
                    }
                    None => {
                        info!("shared queue listener shutting down, no more callers");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_channel_is_namespaced_and_sanitized() {
        assert_eq!(notify_channel("APP.CMD.CREATEUSER.Q"), "cmdq_app_cmd_createuser_q");
    }
}
