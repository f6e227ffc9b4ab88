//! Health evaluation (§6, §7): checks the database pool and the queue
//! adapter's producer state independently and reports which one failed,
//! mirroring the teacher's db-status-plus-circuit-breaker health pattern
//! but narrowed to this platform's two external boundaries.

use std::sync::Arc;

use relaycore_queue::CommandQueue;
use serde::Serialize;
use sqlx::PgPool;

use crate::relay::RelayMetricsSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub database_ok: bool,
    pub queue_ok: bool,
    pub relay: RelayMetricsSnapshot,
}

impl HealthReport {
    /// §6: 200 only when the DB pool AND the queue producer both check out.
    pub fn is_healthy(&self) -> bool {
        self.database_ok && self.queue_ok
    }
}

/// Probe both boundaries and fold in the relay's counters. Each probe is
/// independent: a queue outage does not mask a database outage or vice
/// versa.
pub async fn evaluate(pool: &PgPool, queue: &Arc<dyn CommandQueue>, relay: &RelayMetricsSnapshot) -> HealthReport {
    let database_ok = sqlx::query("SELECT 1").execute(pool).await.is_ok();
    let queue_ok = queue.health_check().await.is_ok();

    HealthReport {
        database_ok,
        queue_ok,
        relay: *relay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_healthy_only_when_both_checks_pass() {
        let relay = RelayMetricsSnapshot {
            claimed: 0,
            published: 0,
            rescheduled: 0,
        };
        let healthy = HealthReport {
            database_ok: true,
            queue_ok: true,
            relay,
        };
        assert!(healthy.is_healthy());

        let db_down = HealthReport {
            database_ok: false,
            queue_ok: true,
            relay,
        };
        assert!(!db_down.is_healthy());

        let queue_down = HealthReport {
            database_ok: true,
            queue_ok: false,
            relay,
        };
        assert!(!queue_down.is_healthy());
    }
}
