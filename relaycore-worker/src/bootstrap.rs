//! Startup wiring shared by the binary and integration tests: connect the
//! pool, build the command queue adapter, and assemble the executor
//! around the caller's handler registry (§4.H, §4.I).

use std::sync::Arc;

use relaycore_queue::{CommandQueue, PgmqCommandQueue};
use relaycore_shared::config::RelayCoreConfig;
use relaycore_shared::errors::PlatformResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::executor::Executor;
use crate::registry::HandlerRegistry;

pub struct Worker {
    pub config: RelayCoreConfig,
    pub pool: PgPool,
    pub queue: Arc<dyn CommandQueue>,
    pub registry: Arc<HandlerRegistry>,
    pub executor: Executor,
}

impl Worker {
    /// Connect to Postgres and build the executor around `registry` — the
    /// caller's own handler registrations. This crate has no hardcoded
    /// business handlers of its own.
    pub async fn bootstrap(config: RelayCoreConfig, registry: HandlerRegistry) -> PlatformResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;

        let queue = PgmqCommandQueue::new_with_pool(pool.clone()).await;
        let queue: Arc<dyn CommandQueue> = Arc::new(queue);
        let registry = Arc::new(registry);

        let executor = Executor::new(
            pool.clone(),
            queue.clone(),
            registry.clone(),
            config.queue_naming.clone(),
            config.topic_naming.clone(),
            config.executor,
        );

        Ok(Self {
            config,
            pool,
            queue,
            registry,
            executor,
        })
    }
}
