//! In-process counters (§7): plain atomics the relay and executor bump as
//! they move work through the system, so operators have something to read
//! without standing up a metrics backend (explicitly out of scope).

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing count, cheap enough to bump on every row.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_starts_at_zero_and_accumulates() {
        let counter = Counter::default();
        assert_eq!(counter.get(), 0);
        counter.incr();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }
}
