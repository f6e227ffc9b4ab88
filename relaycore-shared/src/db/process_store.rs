//! Process instance and append-only process log (§3 "Process instance" /
//! "Process log entry", §4.J, §4.L).
//!
//! Concurrency note (§5): every mutation of `process_instance` begins with
//! `lock_for_update`, which takes the row's exclusive lock before the
//! caller reads its current state. Two replies for the same process id
//! never interleave as long as both go through `lock_for_update` inside
//! the same transaction as their eventual `save` / `append_log` calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::errors::{PlatformError, PlatformResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    New,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    Paused,
}

impl ProcessStatus {
    /// Terminal statuses are sticky (§7 safety property): once reached, no
    /// further log entry may advance status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Succeeded | ProcessStatus::Failed | ProcessStatus::Compensated
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessLogEvent {
    ProcessStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepTimedOut,
    CompensationStarted,
    CompensationCompleted,
    ProcessCompleted,
    ProcessFailed,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ProcessInstanceRow {
    pub process_id: Uuid,
    pub process_type: String,
    pub business_key: String,
    pub status: ProcessStatus,
    pub current_step: String,
    pub data: serde_json::Value,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ProcessLogRow {
    pub process_id: Uuid,
    pub sequence: i64,
    pub event: ProcessLogEvent,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessStore;

impl ProcessStore {
    pub async fn insert(
        conn: &mut PgConnection,
        process_id: Uuid,
        process_type: &str,
        business_key: &str,
        initial_step: &str,
        data: &serde_json::Value,
    ) -> PlatformResult<()> {
        sqlx::query(
            r#"
            INSERT INTO process_instance
                (process_id, process_type, business_key, status, current_step, data, retries, created_at, updated_at)
            VALUES ($1, $2, $3, 'NEW', $4, $5, 0, now(), now())
            "#,
        )
        .bind(process_id)
        .bind(process_type)
        .bind(business_key)
        .bind(initial_step)
        .bind(data)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Take the row's exclusive lock and read its current state (§5). Must
    /// be called inside the transaction that will also persist whatever
    /// follows, so no second reply can observe a half-applied update.
    pub async fn lock_for_update(
        conn: &mut PgConnection,
        process_id: Uuid,
    ) -> PlatformResult<Option<ProcessInstanceRow>> {
        let row = sqlx::query_as::<_, ProcessInstanceRow>(
            "SELECT * FROM process_instance WHERE process_id = $1 FOR UPDATE",
        )
        .bind(process_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub async fn find(
        conn: &mut PgConnection,
        process_id: Uuid,
    ) -> PlatformResult<Option<ProcessInstanceRow>> {
        let row = sqlx::query_as::<_, ProcessInstanceRow>(
            "SELECT * FROM process_instance WHERE process_id = $1",
        )
        .bind(process_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Persist the full mutable state of an instance. Terminal statuses
    /// are sticky — callers must not call this with a non-terminal status
    /// after a terminal one has already been saved (enforced by the
    /// process manager, not this store, since the store has no memory of
    /// the prior value beyond what the caller just read under lock).
    pub async fn save(
        conn: &mut PgConnection,
        process_id: Uuid,
        status: ProcessStatus,
        current_step: &str,
        data: &serde_json::Value,
        retries: i32,
    ) -> PlatformResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE process_instance
            SET status = $2, current_step = $3, data = $4, retries = $5, updated_at = now()
            WHERE process_id = $1
            "#,
        )
        .bind(process_id)
        .bind(status)
        .bind(current_step)
        .bind(data)
        .bind(retries)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PlatformError::ProcessInstanceNotFound(process_id));
        }
        Ok(())
    }

    /// Append one immutable log row. `sequence` is the caller's
    /// responsibility (typically `count(*) + 1` under the same row lock
    /// that guards the instance update) so the ordered log stays a valid
    /// path through the registered graph (§7 safety property).
    pub async fn append_log(
        conn: &mut PgConnection,
        process_id: Uuid,
        sequence: i64,
        event: ProcessLogEvent,
        payload: &serde_json::Value,
    ) -> PlatformResult<()> {
        sqlx::query(
            r#"
            INSERT INTO process_log (process_id, sequence, event, payload, created_at)
            VALUES ($1, $2, $3, $4, now())
            "#,
        )
        .bind(process_id)
        .bind(sequence)
        .bind(event)
        .bind(payload)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn next_sequence(conn: &mut PgConnection, process_id: Uuid) -> PlatformResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM process_log WHERE process_id = $1")
                .bind(process_id)
                .fetch_one(conn)
                .await?;
        Ok(count + 1)
    }

    /// The ordered log is the authoritative history of which steps
    /// completed (§4.L compensation walk).
    pub async fn log_for(
        conn: &mut PgConnection,
        process_id: Uuid,
    ) -> PlatformResult<Vec<ProcessLogRow>> {
        let rows = sqlx::query_as::<_, ProcessLogRow>(
            "SELECT * FROM process_log WHERE process_id = $1 ORDER BY sequence",
        )
        .bind(process_id)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_succeeded_failed_compensated_are_terminal() {
        assert!(ProcessStatus::Succeeded.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(ProcessStatus::Compensated.is_terminal());
        assert!(!ProcessStatus::New.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(!ProcessStatus::Compensating.is_terminal());
        assert!(!ProcessStatus::Paused.is_terminal());
    }
}
