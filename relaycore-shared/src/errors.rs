//! Error taxonomy shared by every crate that touches the command store,
//! the outbox/inbox tables, or the process engine.
//!
//! Variant names follow the kinds enumerated in the platform's error
//! taxonomy (§7), not the call sites that raise them, so operators and
//! callers can classify a failure without knowing which component threw it.

use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Ingress rejected a resubmission of an idempotency key that was
    /// already used — surfaced at ingress as 409.
    #[error("idempotency key already in use: {key}")]
    DuplicateIdempotencyKey { key: String },

    /// No handler is registered for the command's tag; starts the DLQ path.
    #[error("no handler registered for command type: {command_type}")]
    NoHandlerRegistered { command_type: String },

    /// Handler rejected the payload for a reason that retrying will not fix.
    #[error("handler validation error: {0}")]
    HandlerValidationError(String),

    /// Handler failed for a reason retrying may resolve (transient IO, etc).
    #[error("handler transient error: {0}")]
    HandlerTransientError(String),

    /// The command's lease expired while a handler was still running.
    #[error("command lease expired for command {command_id}")]
    CommandLeaseExpired { command_id: uuid::Uuid },

    /// The relay failed to hand a row to the command queue or event bus.
    #[error("outbox dispatch failed for row {row_id}: {reason}")]
    OutboxDispatchError { row_id: uuid::Uuid, reason: String },

    /// A `ProcessConfiguration` failed validation at registration time.
    #[error("invalid process graph for type {process_type}: {reason}")]
    InvalidProcessGraph {
        process_type: String,
        reason: String,
    },

    /// `startProcess` was asked for a type with no registered configuration.
    #[error("unknown process type: {0}")]
    UnknownProcessType(String),

    /// A parallel step declared no branches or no join step.
    #[error("invalid parallel step {step}: {reason}")]
    InvalidParallelStep { step: String, reason: String },

    /// A compensation command itself failed; fatal for the process instance.
    #[error("compensation failed for process {process_id} at step {step}: {reason}")]
    CompensationFailure {
        process_id: uuid::Uuid,
        step: String,
        reason: String,
    },

    /// A process instance row was expected but not found.
    #[error("process instance not found: {0}")]
    ProcessInstanceNotFound(uuid::Uuid),

    /// A command row was expected but not found.
    #[error("command not found: {0}")]
    CommandNotFound(uuid::Uuid),

    /// An illegal status transition was attempted (e.g. SUCCEEDED -> RUNNING).
    #[error("illegal status transition for {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PlatformError {
    /// Default retry classification used by the executor (§4.H) when a
    /// handler does not declare its own `isRetryable(error)`: retry on
    /// IO-kind errors, fail fast on validation.
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(
            self,
            PlatformError::HandlerTransientError(_)
                | PlatformError::CommandLeaseExpired { .. }
                | PlatformError::Database(_)
                | PlatformError::Messaging(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_lease_errors_are_retryable() {
        assert!(PlatformError::HandlerTransientError("boom".into()).is_retryable_by_default());
        assert!(PlatformError::CommandLeaseExpired {
            command_id: uuid::Uuid::nil()
        }
        .is_retryable_by_default());
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!PlatformError::HandlerValidationError("bad payload".into())
            .is_retryable_by_default());
        assert!(!PlatformError::NoHandlerRegistered {
            command_type: "Foo".into()
        }
        .is_retryable_by_default());
    }

    #[test]
    fn display_includes_identifying_fields() {
        let err = PlatformError::DuplicateIdempotencyKey { key: "k1".into() };
        assert_eq!(err.to_string(), "idempotency key already in use: k1");
    }
}
