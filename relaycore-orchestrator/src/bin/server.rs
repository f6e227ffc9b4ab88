//! Orchestrator binary: starts the HTTP ingress surface, the outbox relay
//! sweeper, and the reply consumer side by side, shutting all three down
//! on SIGINT/SIGTERM.

use std::time::Duration;

use relaycore_orchestrator::bootstrap::Orchestrator;
use relaycore_orchestrator::ingress::{self, IngressState};
use relaycore_orchestrator::process::ProcessRegistry;
use relaycore_shared::config::RelayCoreConfig;
use relaycore_shared::logging::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RelayCoreConfig::load()?;
    let orchestrator = Orchestrator::bootstrap(config.clone(), ProcessRegistry::new()).await?;

    let relay = orchestrator.relay;
    let relay_metrics = relay.metrics();
    let relay_task = tokio::spawn(async move { relay.run().await });

    let reply_consumer = orchestrator.reply_consumer;
    let reply_visibility_timeout = Duration::from_secs(config.executor.handler_timeout_secs);
    let reply_task = tokio::spawn(async move {
        reply_consumer.run(config.consumer.concurrency, reply_visibility_timeout).await;
    });

    let state = IngressState {
        pool: orchestrator.pool.clone(),
        bus: orchestrator.bus.clone(),
        queue: orchestrator.queue.clone(),
        relay_metrics,
    };
    let app = ingress::router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "orchestrator listening");

    let shutdown_timeout = Duration::from_millis(config.server.shutdown_timeout_ms);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay_task.abort();
    reply_task.abort();
    tokio::time::sleep(shutdown_timeout.min(Duration::from_millis(500))).await;
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
    info!("shutdown signal received");
}
