//! Wire envelopes exchanged between the ingress HTTP surface, the command
//! queue, and the reply destination (§3 "Command envelope (wire)" /
//! "Reply envelope (wire)", §6).
//!
//! These are value types: no behavior beyond construction helpers and
//! (de)serialization. Header-map conventions are centralized here so every
//! producer and consumer agrees on key names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conventional header keys carried alongside an envelope (§6).
pub mod header_keys {
    pub const IDEMPOTENCY_KEY: &str = "idempotencyKey";
    pub const BUSINESS_KEY: &str = "businessKey";
    pub const PARALLEL_BRANCH: &str = "parallelBranch";
    pub const REPLY_TO: &str = "replyTo";
    pub const PROCESS_STEP: &str = "processStep";
}

pub type Headers = HashMap<String, String>;

/// UTF-8 JSON command envelope (§3, §6): `{commandId, correlationId,
/// commandType, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    /// Carries the process id for saga steps; absent for root requests.
    pub correlation_id: Option<Uuid>,
    pub command_type: String,
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    pub fn new(command_id: Uuid, command_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            command_id,
            correlation_id: None,
            command_type: command_type.into(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Terminal status of a command execution, carried on the reply envelope.
///
/// Invariant (§3): `is_success() <=> status == Completed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    Completed,
    Failed,
    TimedOut,
}

/// UTF-8 JSON reply envelope (§3, §6): `{commandId, correlationId, status,
/// data, error}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    pub command_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub status: ReplyStatus,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
}

impl ReplyEnvelope {
    pub fn completed(command_id: Uuid, correlation_id: Option<Uuid>, data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            command_id,
            correlation_id,
            status: ReplyStatus::Completed,
            data,
            error: None,
        }
    }

    pub fn failed(command_id: Uuid, correlation_id: Option<Uuid>, error: impl Into<String>) -> Self {
        Self {
            command_id,
            correlation_id,
            status: ReplyStatus::Failed,
            data: HashMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn timed_out(command_id: Uuid, correlation_id: Option<Uuid>, error: impl Into<String>) -> Self {
        Self {
            command_id,
            correlation_id,
            status: ReplyStatus::TimedOut,
            data: HashMap::new(),
            error: Some(error.into()),
        }
    }

    /// `isSuccess <=> status = COMPLETED` (§3 invariant).
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Completed
    }

    /// The branch name this reply belongs to, if it is the reply to a
    /// parallel-step branch command (§4.L).
    pub fn parallel_branch(&self) -> Option<&str> {
        self.data
            .get(header_keys::PARALLEL_BRANCH)
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_is_success_matches_status() {
        let completed = ReplyEnvelope::completed(Uuid::nil(), None, HashMap::new());
        assert!(completed.is_success());

        let failed = ReplyEnvelope::failed(Uuid::nil(), None, "boom");
        assert!(!failed.is_success());

        let timed_out = ReplyEnvelope::timed_out(Uuid::nil(), None, "lease expired");
        assert!(!timed_out.is_success());
    }

    #[test]
    fn command_envelope_round_trips_through_json() {
        let env = CommandEnvelope::new(Uuid::nil(), "CreateUser", serde_json::json!({"username": "u1"}))
            .with_correlation_id(Uuid::nil());
        let json = serde_json::to_string(&env).unwrap();
        let parsed: CommandEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn reply_envelope_round_trips_through_json() {
        let mut data = HashMap::new();
        data.insert("result".to_string(), serde_json::json!(42));
        let env = ReplyEnvelope::completed(Uuid::nil(), Some(Uuid::nil()), data);
        let json = serde_json::to_string(&env).unwrap();
        let parsed: ReplyEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn parallel_branch_reads_from_data_map() {
        let mut data = HashMap::new();
        data.insert(
            header_keys::PARALLEL_BRANCH.to_string(),
            serde_json::json!("BookLimits"),
        );
        let env = ReplyEnvelope::completed(Uuid::nil(), None, data);
        assert_eq!(env.parallel_branch(), Some("BookLimits"));
    }
}
