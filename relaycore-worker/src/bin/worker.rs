//! Worker binary: registers domain handlers, then consumes every queue
//! they claim until SIGINT/SIGTERM (§4.H, §4.I, §6).
//!
//! This binary carries no business handlers itself, the same way the
//! orchestrator binary carries no process configurations: both are
//! generic platform shells an application wires handlers/sagas into.

use std::time::Duration;

use relaycore_shared::config::RelayCoreConfig;
use relaycore_shared::logging::init_tracing;
use relaycore_worker::bootstrap::Worker;
use relaycore_worker::{executor::run_consumer, HandlerRegistry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RelayCoreConfig::load()?;
    if !config.consumer.enabled {
        info!("consumer disabled by configuration, exiting");
        return Ok(());
    }

    let registry = HandlerRegistry::new();
    // Application-specific handler registrations go here, e.g.:
    //   registry.register::<CreateUserCommand, _, _>(create_user::handle)?;

    let worker = Worker::bootstrap(config.clone(), registry).await?;
    let metrics = worker.executor.metrics();

    let visibility_timeout = Duration::from_secs(config.executor.handler_timeout_secs);
    let mut consumer_tasks = Vec::new();
    for tag in worker.registry.tags() {
        let destination = config.queue_naming.command_destination(&tag);
        worker.queue.ensure_queue(&destination).await?;
        info!(%destination, "consuming queue");

        let executor = worker.executor.clone();
        consumer_tasks.push(tokio::spawn(run_consumer(
            executor,
            destination,
            config.consumer.concurrency,
            visibility_timeout,
        )));
    }

    if consumer_tasks.is_empty() {
        info!("no handlers registered, nothing to consume");
    }

    shutdown_signal().await;
    info!("shutdown signal received, stopping consumers");
    for task in consumer_tasks {
        task.abort();
    }
    info!(dead_lettered = metrics.dead_lettered.get(), "executor metrics at shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
