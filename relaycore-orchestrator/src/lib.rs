//! Orchestrator process: command ingress, the outbox relay sweeper, the
//! reply consumer, and the saga/process manager (§4.E, §4.F, §4.G, §4.K,
//! §4.L).

pub mod bootstrap;
pub mod bus;
pub mod health;
#[cfg(feature = "web-api")]
pub mod ingress;
pub mod process;
pub mod relay;
pub mod replies;

pub use bus::CommandBus;
pub use health::HealthReport;
pub use process::{ProcessConfiguration, ProcessManager, ProcessRegistry};
pub use relay::{OutboxRelay, RelayMetrics, RelayMetricsSnapshot};
pub use replies::ReplyConsumer;
