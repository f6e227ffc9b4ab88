//! Inbox dedupe gate (§3 "Inbox row", §4.H): the executor inserts a
//! `(message_id, handler)` pair before doing any domain work, and the
//! unique constraint on that pair is what makes redelivery a no-op instead
//! of a double effect.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::errors::PlatformResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// First time this (message_id, handler) pair has been seen; proceed.
    Inserted,
    /// Already processed (or currently being processed) by this handler;
    /// skip the domain effect and replay the prior reply if one exists.
    Duplicate,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboxRow {
    pub message_id: i64,
    pub handler: String,
    pub command_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct InboxStore;

impl InboxStore {
    /// Attempt to claim `(message_id, handler)`. Returns `Duplicate`
    /// without error when the pair already exists — this is the expected,
    /// frequent path under at-least-once delivery, not a failure.
    pub async fn try_insert(
        conn: &mut PgConnection,
        message_id: i64,
        handler: &str,
        command_id: Uuid,
    ) -> PlatformResult<InboxOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (message_id, handler, command_id, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (message_id, handler) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(handler)
        .bind(command_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 1 {
            Ok(InboxOutcome::Inserted)
        } else {
            Ok(InboxOutcome::Duplicate)
        }
    }

    pub async fn find(
        conn: &mut PgConnection,
        message_id: i64,
        handler: &str,
    ) -> PlatformResult<Option<InboxRow>> {
        let row = sqlx::query_as::<_, InboxRow>(
            "SELECT * FROM inbox WHERE message_id = $1 AND handler = $2",
        )
        .bind(message_id)
        .bind(handler)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_distinguishable() {
        assert_ne!(InboxOutcome::Inserted, InboxOutcome::Duplicate);
    }
}
