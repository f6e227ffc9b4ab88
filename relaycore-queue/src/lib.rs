//! Command queue adapter over PGMQ (Postgres Message Queue): a thin,
//! trait-based wrapper so the orchestrator and worker depend on
//! [`CommandQueue`] rather than the `pgmq` crate directly, plus a shared
//! LISTEN/NOTIFY listener so consumers can wake on arrival instead of
//! pure polling.

pub mod listener;
pub mod queue;

pub use listener::QueueNotifier;
pub use queue::{CommandQueue, PgmqCommandQueue, QueuedCommand, ReceivedCommand, ReceivedValue};
