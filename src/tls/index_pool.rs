// src/tls/index_pool.rs
//! Lock-free pool of reusable slot indices.
//!
//! Indices are partitioned into "in-use" and "free": [`get`](IndexPool::get)
//! prefers a previously freed index and otherwise grows the space through a
//! monotonic next-unused counter. Neither operation can fail and neither
//! blocks. The freed-index queue is a `crossbeam` `SegQueue`, whose internal
//! reclamation makes index reuse ABA-safe without any node management here.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free in-use/free partition of `u32` slot indices.
pub(crate) struct IndexPool {
    free: SegQueue<u32>,
    next: AtomicU32,
}

impl IndexPool {
    pub(crate) fn new() -> Self {
        Self {
            free: SegQueue::new(),
            next: AtomicU32::new(0),
        }
    }

    /// Fetches an index: a recycled one if any has been released, otherwise
    /// the next unused value. Cannot fail.
    #[inline]
    pub(crate) fn get(&self) -> u32 {
        self.free
            .pop()
            .unwrap_or_else(|| self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Releases `index` for reuse. Cannot fail.
    #[inline]
    pub(crate) fn add(&self, index: u32) {
        self.free.push(index);
    }

    /// Upper bound on indices ever handed out (free or in use).
    #[inline]
    pub(crate) fn issued(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    /// Drops all freed entries and restarts numbering from zero.
    ///
    /// Caller must guarantee no index is in use and no concurrent access.
    pub(crate) fn unsafe_reset(&self) {
        while self.free.pop().is_some() {}
        self.next.store(0, Ordering::Relaxed);
    }
}

impl Default for IndexPool {
    fn default() -> Self {
        Self::new()
    }
}
