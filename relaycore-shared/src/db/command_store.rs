//! Command row lifecycle and idempotency-key gate (§3 "Command row",
//! §4.D).
//!
//! Every method takes `&mut PgConnection` rather than a generic executor:
//! pool callers acquire a connection (`pool.acquire().await?`), and
//! transactional callers pass `&mut *tx` (`Transaction` derefs to
//! `PgConnection`). This keeps methods free to issue more than one query
//! (e.g. a transition that falls back to a diagnostic read) without
//! fighting sqlx's executor-by-value generics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::errors::{PlatformError, PlatformResult};

/// PENDING -> RUNNING -> {SUCCEEDED, FAILED, TIMED_OUT}; {FAILED,
/// TIMED_OUT} -> RUNNING is the retry path (§3 invariant).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl CommandStatus {
    fn can_transition_to(self, next: CommandStatus) -> bool {
        Self::legal_sources(next).contains(&self)
    }

    /// The statuses a row must currently be in for `next` to be reachable
    /// (§3 invariant), used to scope the transition UPDATE's WHERE clause.
    fn legal_sources(next: CommandStatus) -> &'static [CommandStatus] {
        use CommandStatus::*;
        match next {
            Running => &[Pending, Failed, TimedOut],
            Succeeded | Failed | TimedOut => &[Running],
            Pending => &[],
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: Uuid,
    pub name: String,
    pub business_key: Option<String>,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub status: CommandStatus,
    pub retries: i32,
    pub lease_until: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub headers: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandStore;

impl CommandStore {
    /// Insert a new command row in PENDING. Translates a unique-constraint
    /// violation on `idempotency_key` into `DuplicateIdempotencyKey` so the
    /// ingress layer can map it to a 409 without inspecting SQL state
    /// codes itself.
    pub async fn save_pending(
        conn: &mut PgConnection,
        name: &str,
        idempotency_key: &str,
        business_key: Option<&str>,
        payload: &serde_json::Value,
        headers: &serde_json::Value,
    ) -> PlatformResult<Uuid> {
        let id = Uuid::now_v7();
        let result = sqlx::query(
            r#"
            INSERT INTO command (id, name, business_key, payload, idempotency_key, status, retries, headers, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, now(), now())
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(business_key)
        .bind(payload)
        .bind(idempotency_key)
        .bind(headers)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(PlatformError::DuplicateIdempotencyKey {
                    key: idempotency_key.to_string(),
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Cheap precheck only — NOT authoritative (§4.D). The insert in
    /// `save_pending` is what actually enforces uniqueness.
    pub async fn find_by_idempotency_key(
        conn: &mut PgConnection,
        idempotency_key: &str,
    ) -> PlatformResult<Option<CommandRow>> {
        let row = sqlx::query_as::<_, CommandRow>("SELECT * FROM command WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }

    pub async fn find_by_id(conn: &mut PgConnection, id: Uuid) -> PlatformResult<Option<CommandRow>> {
        let row = sqlx::query_as::<_, CommandRow>("SELECT * FROM command WHERE id = $1")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }

    async fn transition(
        conn: &mut PgConnection,
        id: Uuid,
        next: CommandStatus,
        lease_until: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> PlatformResult<()> {
        let sources = CommandStatus::legal_sources(next);
        let updated: Option<(CommandStatus,)> = sqlx::query_as(
            r#"
            UPDATE command
            SET status = $2, lease_until = $3, error = $4, updated_at = now()
            WHERE id = $1 AND status = ANY($5)
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(next)
        .bind(lease_until)
        .bind(error)
        .bind(sources)
        .fetch_optional(&mut *conn)
        .await?;

        if updated.is_some() {
            return Ok(());
        }

        // Distinguish "row missing" from "illegal transition" for diagnostics.
        match Self::find_by_id(conn, id).await? {
            None => Err(PlatformError::CommandNotFound(id)),
            Some(row) => Err(PlatformError::IllegalTransition {
                entity: "command",
                id: id.to_string(),
                from: format!("{:?}", row.status),
                to: format!("{next:?}"),
            }),
        }
    }

    /// PENDING|FAILED|TIMED_OUT -> RUNNING with a fresh lease.
    pub async fn mark_running(
        conn: &mut PgConnection,
        id: Uuid,
        lease_until: DateTime<Utc>,
    ) -> PlatformResult<()> {
        Self::transition(conn, id, CommandStatus::Running, Some(lease_until), None).await
    }

    pub async fn mark_succeeded(conn: &mut PgConnection, id: Uuid) -> PlatformResult<()> {
        Self::transition(conn, id, CommandStatus::Succeeded, None, None).await
    }

    pub async fn mark_failed(conn: &mut PgConnection, id: Uuid, error: &str) -> PlatformResult<()> {
        Self::transition(conn, id, CommandStatus::Failed, None, Some(error)).await
    }

    pub async fn mark_timed_out(conn: &mut PgConnection, id: Uuid) -> PlatformResult<()> {
        Self::transition(conn, id, CommandStatus::TimedOut, None, Some("lease expired")).await
    }

    /// Atomically increment `retries`; used before scheduling a retry.
    pub async fn bump_retry(conn: &mut PgConnection, id: Uuid) -> PlatformResult<i32> {
        let retries: (i32,) = sqlx::query_as(
            "UPDATE command SET retries = retries + 1, updated_at = now() WHERE id = $1 RETURNING retries",
        )
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(PlatformError::CommandNotFound(id))?;
        Ok(retries.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_follow_the_declared_state_machine() {
        use CommandStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(TimedOut));
        assert!(Failed.can_transition_to(Running));
        assert!(TimedOut.can_transition_to(Running));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use CommandStatus::*;
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(!Pending.can_transition_to(Failed));
    }
}
