//! Startup wiring shared by the binary and integration tests: load
//! config, connect the pool, build the command bus, the process
//! registry, and the outbox relay.

use std::sync::Arc;

use relaycore_queue::{CommandQueue, PgmqCommandQueue};
use relaycore_shared::config::RelayCoreConfig;
use relaycore_shared::errors::PlatformResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::bus::CommandBus;
use crate::process::{ProcessManager, ProcessRegistry};
use crate::relay::OutboxRelay;
use crate::replies::ReplyConsumer;

pub struct Orchestrator {
    pub config: RelayCoreConfig,
    pub pool: PgPool,
    pub bus: CommandBus,
    pub registry: Arc<ProcessRegistry>,
    pub queue: Arc<dyn CommandQueue>,
    pub relay: OutboxRelay,
    pub reply_consumer: ReplyConsumer,
}

impl Orchestrator {
    /// Connect to Postgres, build the command bus and relay, and wire in
    /// `registry` (the caller's registered process types — this crate
    /// carries no hardcoded business sagas).
    pub async fn bootstrap(config: RelayCoreConfig, registry: ProcessRegistry) -> PlatformResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;

        let queue = PgmqCommandQueue::new_with_pool(pool.clone()).await;
        let queue: Arc<dyn CommandQueue> = Arc::new(queue);

        let bus = CommandBus::new(pool.clone(), config.queue_naming.clone(), config.server.clone());
        let relay = OutboxRelay::new(pool.clone(), queue.clone(), config.outbox_relay);
        let registry = Arc::new(registry);

        let manager = ProcessManager::new(pool.clone(), bus.clone(), registry.clone(), config.process_manager);
        let reply_consumer = ReplyConsumer::new(queue.clone(), manager, config.queue_naming.reply_queue.clone());

        Ok(Self {
            config,
            pool,
            bus,
            registry,
            queue,
            relay,
            reply_consumer,
        })
    }

    pub fn process_manager(&self) -> ProcessManager {
        ProcessManager::new(
            self.pool.clone(),
            self.bus.clone(),
            self.registry.clone(),
            self.config.process_manager,
        )
    }
}
