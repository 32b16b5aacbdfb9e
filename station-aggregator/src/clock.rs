//! Lamport logical clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic Lamport counter.
///
/// The aggregator shares one instance across every session, so updates go
/// through atomic read-modify-write operations rather than a lock. Producers
/// and consumers each own a private instance.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock for a local event and returns the new value.
    ///
    /// Saturates at `u64::MAX` so a peer-supplied maximum never wraps it.
    pub fn tick(&self) -> u64 {
        self.advance(|local| local.saturating_add(1))
    }

    /// Merges a peer's clock value: `max(local, remote) + 1`.
    pub fn observe(&self, remote: u64) {
        self.advance(|local| local.max(remote).saturating_add(1));
    }

    fn advance(&self, step: impl Fn(u64) -> u64) -> u64 {
        // The closure always returns Some, so both arms carry the old value.
        let previous = match self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| Some(step(local)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        step(previous)
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}
