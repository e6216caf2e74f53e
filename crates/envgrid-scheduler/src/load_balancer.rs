//! Replica selection.
//!
//! Round-robin uses an atomic cursor, so selection is lock-free and safe
//! for concurrent callers. Random draws uniformly per call.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use envgrid_backend::{BackendError, BackendResult};
use envgrid_core::LbStrategy;

/// Picks one instance per call according to an [`LbStrategy`].
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LbStrategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: LbStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LbStrategy {
        self.strategy
    }

    /// Select the next index into a list of `count` instances.
    ///
    /// Returns `None` if count is zero.
    pub fn next_index(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        match self.strategy {
            LbStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
                Some(idx % count)
            }
            LbStrategy::Random => Some(rand::thread_rng().gen_range(0..count)),
        }
    }

    /// Select one instance.
    pub fn select_instance<'a, T>(&self, instances: &'a [T]) -> BackendResult<&'a T> {
        self.next_index(instances.len())
            .map(|idx| &instances[idx])
            .ok_or_else(|| BackendError::new("no instances to select from"))
    }

    /// Cursor value (for diagnostics). Always zero for Random.
    pub fn current(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LbStrategy::default())
    }
}
