//! Dead-letter sink (§4.H): where the executor deposits a command that
//! exhausted its retry budget, so an operator can inspect and, if
//! warranted, manually resubmit it.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::errors::PlatformResult;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DlqRow {
    pub id: Uuid,
    pub command_id: Uuid,
    pub message_id: i64,
    pub command_name: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct DlqStore;

impl DlqStore {
    pub async fn insert(
        conn: &mut PgConnection,
        command_id: Uuid,
        message_id: i64,
        command_name: &str,
        payload: &serde_json::Value,
        error: &str,
        attempts: i32,
    ) -> PlatformResult<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO command_dlq (id, command_id, message_id, command_name, payload, error, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            "#,
        )
        .bind(id)
        .bind(command_id)
        .bind(message_id)
        .bind(command_name)
        .bind(payload)
        .bind(error)
        .bind(attempts)
        .execute(conn)
        .await?;
        Ok(id)
    }

    pub async fn find_by_command_id(
        conn: &mut PgConnection,
        command_id: Uuid,
    ) -> PlatformResult<Option<DlqRow>> {
        let row = sqlx::query_as::<_, DlqRow>("SELECT * FROM command_dlq WHERE command_id = $1")
            .bind(command_id)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }
}
