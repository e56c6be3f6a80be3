// src/pool/stats.rs
//! Pool statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Internal counters, updated with `Relaxed` ordering on the hot paths.
pub(crate) struct StatsInner {
    pub(crate) gets: AtomicUsize,
    pub(crate) recycles: AtomicUsize,
    pub(crate) discards: AtomicUsize,
    pub(crate) cache_refills: AtomicUsize,
    pub(crate) blocks_allocated: AtomicUsize,
}

impl StatsInner {
    pub(crate) fn new() -> Self {
        Self {
            gets: AtomicUsize::new(0),
            recycles: AtomicUsize::new(0),
            discards: AtomicUsize::new(0),
            cache_refills: AtomicUsize::new(0),
            blocks_allocated: AtomicUsize::new(0),
        }
    }
}

/// Snapshot of pool statistics.
///
/// All counters use `Relaxed` ordering; values are eventually consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Items handed out.
    pub gets: usize,
    /// Items returned for reuse.
    pub recycles: usize,
    /// Recycled items that belonged to a retired block and were discarded.
    pub discards: usize,
    /// Times a thread exhausted its local cache and pulled a full one from
    /// the global queue.
    pub cache_refills: usize,
    /// Blocks allocated over the pool's lifetime.
    pub blocks_allocated: usize,
    /// Full caches currently queued for hand-out (approximate).
    pub full_caches: usize,
    /// Depleted caches currently queued for refill (approximate).
    pub empty_caches: usize,
}

impl PoolStats {
    /// Fraction of recycled items that were discarded rather than recirculated.
    pub fn discard_rate(&self) -> f64 {
        if self.recycles == 0 {
            0.0
        } else {
            self.discards as f64 / self.recycles as f64 * 100.0
        }
    }
}

impl StatsInner {
    pub(crate) fn snapshot(&self, full_caches: usize, empty_caches: usize) -> PoolStats {
        PoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            cache_refills: self.cache_refills.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            full_caches,
            empty_caches,
        }
    }
}
