//! Postgres-backed storage for the command/inbox/outbox/DLQ/process tables
//! (§3, §4.B–§4.D, §4.J). Every store here is a thin wrapper around a
//! `PgPool` (or an externally-managed transaction) — there is no ambient
//! mutable state beyond the connection pool itself, matching §5's "no
//! ambient mutable singleton" policy.

pub mod command_store;
pub mod dlq_store;
pub mod inbox_store;
pub mod outbox_store;
pub mod process_store;

pub use command_store::{CommandRow, CommandStatus, CommandStore};
pub use dlq_store::{DlqRow, DlqStore};
pub use inbox_store::{InboxOutcome, InboxStore};
pub use outbox_store::{OutboxCategory, OutboxRow, OutboxStatus, OutboxStore};
pub use process_store::{
    ProcessInstanceRow, ProcessLogEvent, ProcessLogRow, ProcessStatus, ProcessStore,
};
