//! Scoped-transaction abstraction (§9 design note): replaces
//! annotation-driven transactions with an explicit `run` that opens a
//! connection, begins, runs the closure, commits on success, and rolls
//! back on any failure. Every multi-table write in the command bus (§4.E)
//! and the executor (§4.H) goes through this so the state-change and its
//! outbox row always commit or abort together.

use std::future::Future;
use std::pin::Pin;

use sqlx::{PgPool, Postgres, Transaction};

use crate::errors::PlatformResult;

/// Run `f` inside one transaction against `pool`. Commits iff `f` returns
/// `Ok`; otherwise the transaction is dropped (and therefore rolled back).
pub async fn run<'p, F, T>(pool: &'p PgPool, f: F) -> PlatformResult<T>
where
    F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> Pin<Box<dyn Future<Output = PlatformResult<T>> + Send + 'c>>,
{
    let mut tx = pool.begin().await?;
    let result = f(&mut tx).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            // Dropping `tx` without commit rolls back; an explicit
            // rollback surfaces connection-level errors instead of
            // swallowing them.
            tx.rollback().await?;
            Err(err)
        }
    }
}
