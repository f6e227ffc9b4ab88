//! The worker process: the handler registry and the executor loop that
//! drains command queues against it (§4.H, §4.I).

pub mod bootstrap;
pub mod executor;
pub mod registry;

pub use bootstrap::Worker;
pub use executor::{run_consumer, Executor, ExecutorMetrics};
pub use registry::{CommandHandler, DomainCommand, DomainEvent, HandlerOutcome, HandlerRegistry};
