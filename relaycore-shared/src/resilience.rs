//! Backoff math and a circuit-breaker seam for the two external boundaries
//! this platform has: the database pool and the queue adapter.
//!
//! The trait is object-safe (`Send + Sync + Debug`), narrowed to what the
//! relay and
//! executor actually need; a full sliding-window implementation is not
//! part of the core and is left to the `Simple` breaker below, which is
//! enough to stop hammering a down dependency without adding a metrics
//! stack.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Exponential backoff with full jitter, capped (§4.G): `rand(0, min(cap,
/// base * 2^attempts))`. `attempts` is the 1-based attempt count *after*
/// the failure being backed off from (i.e. pass `attempts + 1` when
/// rescheduling after the first failure).
pub fn backoff_with_full_jitter(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base
        .as_millis()
        .saturating_mul(1u128 << attempts.min(32))
        .min(cap.as_millis());
    let upper = exp.max(1) as u64;
    let jittered = rand::random::<u64>() % upper;
    Duration::from_millis(jittered)
}

/// Circuit state, matching the standard three-state breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Unified interface for protecting a call boundary (database, queue
/// adapter) from cascading failure. Object-safe so callers can hold
/// `&dyn CircuitBreakerBehavior` when uniform handling is needed (e.g. the
/// health endpoint reporting on every guarded dependency at once).
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self);
    fn record_failure(&self);
    fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }
}

/// A minimal consecutive-failure breaker: opens after `failure_threshold`
/// consecutive failures, half-opens after `recovery_timeout`, and closes on
/// the next success.
#[derive(Debug)]
pub struct SimpleCircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    start: std::time::Instant,
}

impl SimpleCircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            start: std::time::Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl CircuitBreakerBehavior for SimpleCircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        let opened_at = self.opened_at_millis.load(Ordering::Relaxed);
        if opened_at == 0 {
            return CircuitState::Closed;
        }
        if self.now_millis().saturating_sub(opened_at) >= self.recovery_timeout.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    fn should_allow(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.opened_at_millis.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            let _ = self.opened_at_millis.compare_exchange(
                0,
                self.now_millis().max(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        let cap = Duration::from_millis(60_000);
        for attempts in 0..40 {
            let d = backoff_with_full_jitter(attempts, Duration::from_millis(1_000), cap);
            assert!(d <= cap, "attempt {attempts} produced {d:?} > cap");
        }
    }

    #[test]
    fn backoff_grows_with_attempts_on_average() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(100_000);
        let sample = |attempts: u32| -> u128 {
            (0..200)
                .map(|_| backoff_with_full_jitter(attempts, base, cap).as_millis())
                .sum::<u128>()
                / 200
        };
        assert!(sample(1) < sample(5));
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_and_half_opens_after_timeout() {
        let breaker = SimpleCircuitBreaker::new("db", 3, Duration::from_millis(0));
        assert!(breaker.should_allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.should_allow(), "below threshold, still closed");
        breaker.record_failure();
        // recovery_timeout is 0ms so it immediately reports half-open (allowed).
        assert!(breaker.should_allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let breaker = SimpleCircuitBreaker::new("queue", 2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_healthy());
    }
}
