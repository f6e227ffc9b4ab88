//! Shared types and storage for the command-processing platform:
//! envelopes, configuration, the error taxonomy, resilience primitives,
//! the scoped-transaction helper, and the Postgres-backed stores for the
//! command/inbox/outbox/DLQ/process tables.

pub mod config;
pub mod db;
pub mod envelope;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod transaction;

pub use config::RelayCoreConfig;
pub use envelope::{CommandEnvelope, Headers, ReplyEnvelope, ReplyStatus};
pub use errors::{PlatformError, PlatformResult};
