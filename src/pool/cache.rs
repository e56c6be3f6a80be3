// src/pool/cache.rs
//! Fixed-length item-pointer caches and the lock-free queues that carry them.
//!
//! A [`Cache`] is a small boxed array of row pointers, exclusively owned at
//! any moment by exactly one place: the global full-cache queue, the global
//! empty-cache queue, a thread's active cache, or a thread's retiree list.
//! Caches shuttle between those owners; the pointers inside are only
//! meaningful while the cache sits in a "full" position.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-length array of item (row) pointers.
pub(crate) struct Cache<T> {
    rows: Box<[*mut T]>,
}

// SAFETY: a Cache is a plain container of addresses; ownership of the
// pointed-to slots travels with the cache itself, which is moved between
// owners, never shared.
unsafe impl<T> Send for Cache<T> {}

impl<T> Cache<T> {
    pub(crate) fn with_len(len: usize) -> Self {
        Self {
            rows: vec![std::ptr::null_mut(); len].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> *mut T {
        self.rows[index]
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize, item: *mut T) {
        self.rows[index] = item;
    }
}

/// Wrapper around `crossbeam::SegQueue` that tracks an approximate length.
///
/// The counter and the queue are **not** updated atomically, so `len()` may
/// be briefly stale. This is acceptable for statistics and sizing
/// heuristics.
pub(crate) struct CacheQueue<T> {
    items: SegQueue<Cache<T>>,
    size: AtomicUsize,
}

impl<T> CacheQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: SegQueue::new(),
            size: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn push(&self, cache: Cache<T>) {
        self.items.push(cache);
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn pop(&self) -> Option<Cache<T>> {
        self.items.pop().inspect(|_| {
            self.size.fetch_sub(1, Ordering::Relaxed);
        })
    }

    /// Approximate queue length — may be briefly stale.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Drops every queued cache.
    pub(crate) fn drain(&self) {
        while self.pop().is_some() {}
    }
}
