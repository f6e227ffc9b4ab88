//! Transactional outbox (§3 "Outbox row", §4.G): writers insert a row in
//! the same transaction as their state change, and the relay sweeper is
//! the only process that ever moves a row from NEW to SENDING to
//! PUBLISHED.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so multiple relay instances can
//! run concurrently without contending on the same rows, following the
//! same pattern as other claim-based work queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::errors::PlatformResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxCategory {
    Command,
    Reply,
    Event,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    New,
    Sending,
    Published,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: Uuid,
    pub category: OutboxCategory,
    pub destination: String,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    /// The reason the most recent dispatch attempt failed, if any (§4.B,
    /// §7: "the outbox row's last-failure reason stored... for
    /// diagnostics"). Cleared implicitly by never being read once the row
    /// is PUBLISHED.
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct OutboxStore;

impl OutboxStore {
    /// Insert a NEW row, immediately available for the relay to claim.
    /// Callers write this in the same transaction as the state change it
    /// reports on (§4.G invariant: the outbox row and its cause commit
    /// together or not at all).
    pub async fn insert(
        conn: &mut PgConnection,
        category: OutboxCategory,
        destination: &str,
        payload: &serde_json::Value,
        headers: &serde_json::Value,
    ) -> PlatformResult<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO outbox (id, category, destination, payload, headers, status, attempts, available_at, created_at)
            VALUES ($1, $2, $3, $4, $5, 'NEW', 0, now(), now())
            "#,
        )
        .bind(id)
        .bind(category)
        .bind(destination)
        .bind(payload)
        .bind(headers)
        .execute(conn)
        .await?;
        Ok(id)
    }

    /// Claim up to `limit` rows that are NEW-and-due or stuck in SENDING
    /// past `stale_after`, marking them SENDING under row locks so a
    /// second relay instance skips them instead of blocking (§4.G).
    pub async fn claim_batch(
        conn: &mut PgConnection,
        limit: i64,
        stale_after: chrono::Duration,
    ) -> PlatformResult<Vec<OutboxRow>> {
        let stale_before = Utc::now() - stale_after;
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            WITH claimed AS (
                SELECT id FROM outbox
                WHERE (status = 'NEW' AND available_at <= now())
                   OR (status = 'SENDING' AND claimed_at <= $2)
                ORDER BY available_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox
            SET status = 'SENDING', claimed_at = now()
            WHERE id IN (SELECT id FROM claimed)
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(stale_before)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// Mark a row PUBLISHED once the queue adapter has confirmed delivery.
    /// Callers must send before calling this — never the reverse — so a
    /// crash between send and mark just causes a harmless redelivery on
    /// the next stale-reclaim sweep rather than a lost message (§4.G).
    pub async fn mark_published(conn: &mut PgConnection, id: Uuid) -> PlatformResult<()> {
        sqlx::query("UPDATE outbox SET status = 'PUBLISHED' WHERE id = $1")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Return a claimed row to NEW with a future `available_at`, after a
    /// failed send. `attempts` is incremented so backoff math has a basis,
    /// and `reason` is retained in `last_error` so operators can read why a
    /// row is stuck without correlating against relay logs (§4.B, §7).
    pub async fn reschedule(
        conn: &mut PgConnection,
        id: Uuid,
        available_at: DateTime<Utc>,
        reason: &str,
    ) -> PlatformResult<()> {
        sqlx::query(
            "UPDATE outbox SET status = 'NEW', attempts = attempts + 1, available_at = $2, claimed_at = NULL, last_error = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(available_at)
        .bind(reason)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_round_trip_through_serde() {
        let json = serde_json::to_string(&OutboxCategory::Reply).unwrap();
        assert_eq!(json, "\"REPLY\"");
        let parsed: OutboxCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, OutboxCategory::Reply);
    }

    #[test]
    fn statuses_round_trip_through_serde() {
        for status in [OutboxStatus::New, OutboxStatus::Sending, OutboxStatus::Published] {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: OutboxStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, status);
        }
    }
}
