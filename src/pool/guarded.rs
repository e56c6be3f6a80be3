// src/pool/guarded.rs
//! The guarded object pool.
//!
//! # Architecture
//!
//! [`try_get`](GuardPool::try_get) follows a three-tier cascade:
//!
//! 1. **Thread-local full cache** (no synchronization at all)
//! 2. **Global full-cache queue** (lock-free pop)
//! 3. **Block publication** (cooperative; only when the queue runs dry)
//!
//! Blocks live in a 19-slot ring, slot `i` holding `2^(i+1)` rows, published
//! through a release-ordered end index so a reader that observes the new end
//! sees a fully initialized block including its key. Publication is
//! cooperative: every thread that finds the queue empty helps slice the
//! winning block into cache-sized pieces by fetch-adding the block's
//! `push_sync` cursor, so after publication the queue is warm and subsequent
//! gets never touch block structures.
//!
//! # Reclamation
//!
//! [`recycle`](GuardPool::recycle) never republishes an item directly. The
//! item goes into the thread's deferred-reclaim cache; when that fills, the
//! thread snapshots all reader epochs and re-evaluates its *retirees* —
//! earlier deferred caches still waiting for the all-clear. A retiree is
//! held back by thread `i` exactly while `i`'s counter is odd (inside a
//! critical section) *and* unchanged since the retiree was created; once
//! every such bit clears, the cache returns to the global full queue.
//! [`guard`](GuardPool::guard) brackets a critical section by incrementing
//! the calling thread's counter on entry and exit, so odd means "inside".
//! The exit increment lives in a drop guard and survives an unwind from the
//! user callable.
//!
//! Up to [`MAX_USERS`] threads may participate in guarding. A thread draws
//! its epoch lane on first use and releases it on thread exit through a
//! thread-local scope guard.
//!
//! # Item lifecycle invariants
//!
//! Every pointer handed out was carved from a published block; no pointer is
//! in the full-cache queue while a reader that was inside a critical section
//! at its retirement is still in that same section. Items of blocks retired
//! by [`unsafe_reset`](GuardPool::unsafe_reset) are *discarded* on recycle
//! instead: the block's `living_items` drops by one and the storage is freed
//! when it reaches zero. A recycled pointer the pool has never owned is a
//! fatal precondition violation.

use crate::error::{PoolError, Result};
use crate::pool::block::{BLOCK_SLOTS, Block, MAX_CAPACITY};
use crate::pool::cache::{Cache, CacheQueue};
use crate::pool::config::{PoolConfig, log2_align};
use crate::pool::stats::{PoolStats, StatsInner};
use crate::tls::index_pool::IndexPool;
use crate::tls::member::cas_slot;
use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::utils::CachePadded;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thread_local::ThreadLocal;

/// Maximum number of threads that may concurrently enter [`GuardPool::guard`]
/// against one pool.
pub const MAX_USERS: usize = 16;

// ---------------------------------------------------------------------------
// Per-thread state
// ---------------------------------------------------------------------------

struct PoolThread<T> {
    /// Active full cache and the next index to hand out from it.
    cache: Option<Cache<T>>,
    cache_pos: u32,
    /// Deferred-reclaim cache and its fill cursor.
    reclaim: Option<Cache<T>>,
    reclaim_pos: u32,
    /// This thread's lane in the reader-epoch array, once drawn.
    user_index: Option<u32>,
    /// Last observed value of every reader epoch.
    epoch_snapshot: [u32; MAX_USERS],
    /// Deferred caches whose reclamation still waits on other threads:
    /// (blocking-thread mask, cache).
    retirees: Vec<(u32, Cache<T>)>,
    /// Pool generation these caches belong to.
    generation: u64,
}

impl<T> PoolThread<T> {
    fn new(generation: u64) -> Self {
        Self {
            cache: None,
            cache_pos: 0,
            reclaim: None,
            reclaim_pos: 0,
            user_index: None,
            epoch_snapshot: [0; MAX_USERS],
            retirees: Vec::new(),
            generation,
        }
    }

    fn fetch_from_cache(&mut self) -> Option<*mut T> {
        let cache = self.cache.as_ref()?;
        if self.cache_pos < cache.len() as u32 {
            let item = cache.get(self.cache_pos as usize);
            self.cache_pos += 1;
            Some(item)
        } else {
            None
        }
    }
}

/// Increments the epoch counter on construction and again on drop, so the
/// counter is odd exactly while the section is open — including across an
/// unwind out of the guarded callable.
struct CriticalSection<'a> {
    counter: &'a AtomicU32,
}

impl<'a> CriticalSection<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        let prev = counter.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev % 2 == 0, "nested guard on one thread");
        Self { counter }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Thread-exit release of epoch lanes
// ---------------------------------------------------------------------------

trait UserSlotRelease: Send + Sync {
    fn release_user_slot(&self, index: u32);
}

/// Releases every epoch lane this thread drew, when the thread exits.
struct ThreadExitGuards {
    slots: Vec<(Weak<dyn UserSlotRelease>, u32)>,
}

impl Drop for ThreadExitGuards {
    fn drop(&mut self) {
        for (pool, index) in self.slots.drain(..) {
            if let Some(pool) = pool.upgrade() {
                pool.release_user_slot(index);
            }
        }
    }
}

thread_local! {
    static EXIT_GUARDS: RefCell<ThreadExitGuards> =
        RefCell::new(ThreadExitGuards { slots: Vec::new() });
}

// ---------------------------------------------------------------------------
// Shared pool state
// ---------------------------------------------------------------------------

struct PoolShared<T: Send> {
    blocks: [ArcSwapOption<Block<T>>; BLOCK_SLOTS],
    blocks_end: AtomicU8,
    /// Blocks taken out of the ring by `unsafe_reset`, kept for discard
    /// accounting until their `living_items` reaches zero.
    retired: ArcSwap<Vec<Arc<Block<T>>>>,
    full_caches: CacheQueue<T>,
    empty_caches: CacheQueue<T>,
    epochs: [CachePadded<AtomicU32>; MAX_USERS],
    user_indices: IndexPool,
    threads: ThreadLocal<RefCell<PoolThread<T>>>,
    /// Rows per thread-local cache slice.
    tl_cache_size: u32,
    row_length: u32,
    /// Ring slot holding the base-capacity block.
    base_block_index: u8,
    /// Bumped by `unsafe_reset`; stale thread caches are abandoned.
    generation: AtomicU64,
    stats: StatsInner,
}

impl<T: Send + 'static> UserSlotRelease for PoolShared<T> {
    fn release_user_slot(&self, index: u32) {
        self.user_indices.add(index);
    }
}

// ---------------------------------------------------------------------------
// GuardPool
// ---------------------------------------------------------------------------

/// Lock-free typed object pool with epoch-guarded reclamation.
///
/// Hands out raw `*mut T` items — uninitialized by contract — from
/// pre-allocated, exponentially growing blocks. Recycled items are held in
/// per-thread deferred caches and only recirculated once no thread that was
/// inside a [`guard`](Self::guard) section at retirement time can still be
/// referencing them, making it safe to traverse shared structures whose
/// nodes live in the pool.
///
/// # Example
///
/// ```rust
/// use guardpool::prelude::*;
///
/// let pool: GuardPool<u64> = GuardPool::new(PoolConfig::default());
///
/// let item = pool.get();
/// unsafe { item.write(7) };
/// let value = pool.guard(|| unsafe { item.read() });
/// assert_eq!(value, 7);
/// pool.recycle(item);
/// ```
pub struct GuardPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> GuardPool<T> {
    /// Creates a pool, reserving `config.base_capacity` items up front.
    ///
    /// # Panics
    ///
    /// Panics on a zero config field, or if the initial reservation cannot
    /// be satisfied. Use [`try_new`](Self::try_new) for a fallible variant.
    pub fn new(config: PoolConfig) -> Self {
        match Self::try_new(config) {
            Ok(pool) => pool,
            Err(e) => panic!("{}", e),
        }
    }

    /// Creates a pool, reserving `config.base_capacity` items up front.
    pub fn try_new(config: PoolConfig) -> Result<Self> {
        assert!(
            config.base_capacity >= 1 && config.tl_cache_size >= 1 && config.row_length >= 1,
            "pool config fields must be at least 1"
        );

        // Largest power-of-two row count whose T-unit span is encodable.
        let row_clamp = MAX_CAPACITY / config.row_length;
        if row_clamp < 2 {
            return Err(PoolError::CapacityExhausted);
        }
        let row_clamp = (row_clamp / 2 + 1).next_power_of_two();

        let base_rows = log2_align(config.base_capacity, row_clamp);
        let tl_cache_size = log2_align(config.tl_cache_size, base_rows);
        let base_block_index = (base_rows.trailing_zeros() - 1) as u8;

        let shared = Arc::new(PoolShared {
            blocks: std::array::from_fn(|_| ArcSwapOption::empty()),
            blocks_end: AtomicU8::new(base_block_index),
            retired: ArcSwap::from_pointee(Vec::new()),
            full_caches: CacheQueue::new(),
            empty_caches: CacheQueue::new(),
            epochs: std::array::from_fn(|_| CachePadded::new(AtomicU32::new(0))),
            user_indices: IndexPool::new(),
            threads: ThreadLocal::new(),
            tl_cache_size,
            row_length: config.row_length,
            base_block_index,
            generation: AtomicU64::new(0),
            stats: StatsInner::new(),
        });

        shared.try_alloc_block(base_block_index)?;

        Ok(Self { shared })
    }

    /// Creates a pool with the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    /// Fetches an item. The caller owns the slot exclusively — and is
    /// responsible for initializing it — until it is passed back to
    /// [`recycle`](Self::recycle). Never null.
    ///
    /// Fails only when the pool cannot grow further: every block slot is
    /// exhausted or the allocator refused a new block. The pool stays usable
    /// at its current capacity after such a failure.
    pub fn try_get(&self) -> Result<*mut T> {
        self.shared.stats.gets.fetch_add(1, Ordering::Relaxed);
        let cell = self.thread_cell();
        let mut tl = cell.borrow_mut();
        self.check_generation(&mut tl);

        loop {
            if let Some(item) = tl.fetch_from_cache() {
                return Ok(item);
            }

            // Local cache exhausted: trade it for a full one.
            if let Some(depleted) = tl.cache.take() {
                self.shared.empty_caches.push(depleted);
            }
            tl.cache = Some(self.shared.acquire_full_cache()?);
            tl.cache_pos = 0;
            self.shared
                .stats
                .cache_refills
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fetches an item, treating exhaustion as fatal.
    ///
    /// # Panics
    ///
    /// Panics when [`try_get`](Self::try_get) would fail.
    pub fn get(&self) -> *mut T {
        match self.try_get() {
            Ok(item) => item,
            Err(e) => panic!("{}", e),
        }
    }

    /// Marks `item` for reuse once no guarded reader can still hold it.
    ///
    /// The caller must not touch `item` afterwards. An item belonging to a
    /// block retired by [`unsafe_reset`](Self::unsafe_reset) is discarded
    /// instead of recirculated.
    ///
    /// # Panics
    ///
    /// Panics if `item` was not produced by this pool.
    pub fn recycle(&self, item: *mut T) {
        self.shared.stats.recycles.fetch_add(1, Ordering::Relaxed);

        if self.shared.is_current(item) {
            let cell = self.thread_cell();
            let mut tl = cell.borrow_mut();
            self.check_generation(&mut tl);
            self.add_to_deferred(&mut tl, item);
        } else {
            self.shared.discard_item(item);
        }
    }

    /// Runs `f` inside a critical section of this pool's reclamation scheme.
    ///
    /// While any thread is inside `guard`, no item recycled during that
    /// window is recirculated until the section closes, so `f` may safely
    /// read pool-managed nodes reachable through shared structures. The
    /// section closes even if `f` unwinds. `guard` must not be nested on one
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics when more than [`MAX_USERS`] threads participate.
    pub fn guard<R>(&self, f: impl FnOnce() -> R) -> R {
        let user_index = self.ensure_user_index();
        let counter = &*self.shared.epochs[user_index as usize];
        let _section = CriticalSection::enter(counter);
        f()
    }

    /// Returns a snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats.snapshot(
            self.shared.full_caches.len(),
            self.shared.empty_caches.len(),
        )
    }

    /// Resets the pool to its freshly constructed state.
    ///
    /// All published blocks are retired; items still held by clients are
    /// accepted by [`recycle`](Self::recycle) afterwards but discarded, and
    /// are never handed out again. The base-capacity block is republished so
    /// the pool replays an identical operation sequence the way a newly
    /// constructed pool would.
    ///
    /// # Safety
    ///
    /// No other thread may access the pool concurrently, in any way.
    pub unsafe fn unsafe_reset(&self) {
        let shared = &self.shared;

        let mut retired: Vec<Arc<Block<T>>> = shared
            .retired
            .load()
            .iter()
            // Bookkeeping of fully discarded blocks can finally go.
            .filter(|b| b.storage_live())
            .cloned()
            .collect();
        for slot in shared.blocks.iter() {
            if let Some(block) = slot.swap(None) {
                retired.push(block);
            }
        }
        shared.retired.store(Arc::new(retired));

        shared.full_caches.drain();
        shared.empty_caches.drain();

        // Published before the new end index so threads abandon their
        // caches before they can observe the republished block.
        shared.generation.fetch_add(1, Ordering::Release);

        shared
            .blocks_end
            .store(shared.base_block_index, Ordering::Relaxed);
        // On allocation failure the pool simply starts empty; the next get
        // retries the publication.
        let _ = shared.try_alloc_block(shared.base_block_index);
    }

    // -- internals ---------------------------------------------------------

    fn thread_cell(&self) -> &RefCell<PoolThread<T>> {
        self.shared.threads.get_or(|| {
            RefCell::new(PoolThread::new(
                self.shared.generation.load(Ordering::Acquire),
            ))
        })
    }

    /// Abandons caches that predate the last reset; their items belong to
    /// retired blocks and must not recirculate.
    fn check_generation(&self, tl: &mut PoolThread<T>) {
        let generation = self.shared.generation.load(Ordering::Acquire);
        if tl.generation != generation {
            tl.cache = None;
            tl.cache_pos = 0;
            tl.reclaim = None;
            tl.reclaim_pos = 0;
            tl.retirees.clear();
            tl.generation = generation;
        }
    }

    fn add_to_deferred(&self, tl: &mut PoolThread<T>, item: *mut T) {
        let pos = tl.reclaim_pos;
        if tl.reclaim.is_none() || pos >= self.shared.tl_cache_size {
            self.evaluate_caches_for_reclamation(tl);
            tl.reclaim = Some(self.shared.acquire_empty_cache());
            tl.reclaim_pos = 1;
            if let Some(cache) = &mut tl.reclaim {
                cache.set(0, item);
            }
            return;
        }
        tl.reclaim_pos += 1;
        if let Some(cache) = &mut tl.reclaim {
            cache.set(pos as usize, item);
        }
    }

    /// Re-judges every outstanding retiree against a fresh epoch snapshot,
    /// releasing the ones nobody can still observe, and turns the filled
    /// deferred cache into a new retiree.
    fn evaluate_caches_for_reclamation(&self, tl: &mut PoolThread<T>) {
        let (odd, unchanged) = self.update_epoch_snapshot(tl);
        let still_blocked = odd & unchanged;

        for retiree in tl.retirees.iter_mut() {
            retiree.0 &= still_blocked;
        }
        if let Some(cache) = tl.reclaim.take() {
            tl.retirees.push((odd, cache));
        }

        let mut i = 0;
        while i < tl.retirees.len() {
            if tl.retirees[i].0 == 0 {
                let (_, cache) = tl.retirees.swap_remove(i);
                self.shared.full_caches.push(cache);
            } else {
                i += 1;
            }
        }
    }

    /// Scans all reader epochs. Bit `i` of `odd` is set when thread `i` is
    /// inside a critical section right now; bit `i` of `unchanged` when its
    /// counter has not moved since this thread's previous scan. The own bit
    /// is always cleared.
    fn update_epoch_snapshot(&self, tl: &mut PoolThread<T>) -> (u32, u32) {
        let mut odd = 0u32;
        let mut unchanged = 0u32;
        for i in 0..MAX_USERS {
            let previous = tl.epoch_snapshot[i];
            let current = self.shared.epochs[i].load(Ordering::Acquire);
            if current % 2 == 1 {
                odd |= 1 << i;
            }
            if current == previous {
                unchanged |= 1 << i;
            }
            tl.epoch_snapshot[i] = current;
        }
        if let Some(own) = tl.user_index {
            let own_bit = 1u32 << own;
            odd &= !own_bit;
            unchanged &= !own_bit;
        }
        (odd, unchanged)
    }

    fn ensure_user_index(&self) -> u32 {
        let cell = self.thread_cell();
        let mut tl = cell.borrow_mut();
        if let Some(index) = tl.user_index {
            return index;
        }

        let index = self.shared.user_indices.get();
        assert!(
            (index as usize) < MAX_USERS,
            "more than {} concurrent guard threads against this pool",
            MAX_USERS
        );
        tl.user_index = Some(index);
        drop(tl);

        let shared_dyn: Arc<dyn UserSlotRelease> = self.shared.clone();
        let weak: Weak<dyn UserSlotRelease> = Arc::downgrade(&shared_dyn);
        EXIT_GUARDS.with(|guards| guards.borrow_mut().slots.push((weak, index)));
        index
    }
}

impl<T: Send + 'static> PoolShared<T> {
    fn acquire_full_cache(&self) -> Result<Cache<T>> {
        loop {
            if let Some(cache) = self.full_caches.pop() {
                return Ok(cache);
            }
            let end = self.blocks_end.load(Ordering::Acquire);
            if let Some(cache) = self.full_caches.pop() {
                return Ok(cache);
            }
            self.try_alloc_block(end)?;
        }
    }

    fn acquire_empty_cache(&self) -> Cache<T> {
        self.empty_caches
            .pop()
            .unwrap_or_else(|| Cache::with_len(self.tl_cache_size as usize))
    }

    /// Three-step cooperative block publication; see the module docs.
    fn try_alloc_block(&self, index: u8) -> Result<()> {
        if index as usize >= BLOCK_SLOTS {
            return Err(PoolError::CapacityExhausted);
        }

        let slot = &self.blocks[index as usize];
        let rows = 1u32 << (index + 1);

        // Step 1: install a block into the slot; losers adopt the winner's.
        let mut current = slot.load_full();
        if current.is_none() {
            let fresh = Block::alloc(rows, self.row_length)?;
            if cas_slot(slot, &None, Some(Arc::clone(&fresh))) {
                self.stats.blocks_allocated.fetch_add(1, Ordering::Relaxed);
                current = Some(fresh);
            } else {
                current = slot.load_full();
            }
        }
        let Some(block) = current else {
            // Slot emptied again under us — only a racing reset does that,
            // and reset forbids concurrent access. Nothing to publish.
            return Ok(());
        };

        // Step 2: the key; racing writers store the identical value.
        block.publish_key();

        // Step 3: cooperative slicing into tl-cache-sized pieces.
        let slice_rows = self.tl_cache_size;
        let mut start = block.claim_slice(slice_rows);
        while start < rows {
            let mut cache = Cache::with_len(slice_rows as usize);
            for i in 0..slice_rows {
                cache.set(i as usize, block.row_ptr(start + i, self.row_length));
            }
            self.full_caches.push(cache);
            start = block.claim_slice(slice_rows);
        }

        // Publish: only the natural successor advances the end index.
        let _ = self.blocks_end.compare_exchange(
            index,
            index + 1,
            Ordering::Release,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Whether `item` belongs to any published block — including the
    /// speculative next slot, whose caches may circulate before the end
    /// index advances.
    fn is_current(&self, item: *const T) -> bool {
        let end = self.blocks_end.load(Ordering::Acquire) as usize;
        for i in 0..=end.min(BLOCK_SLOTS - 1) {
            if let Some(block) = &*self.blocks[i].load() {
                if block.contains(item) {
                    return true;
                }
            }
        }
        false
    }

    /// Accounts one discarded item against its retired block.
    ///
    /// # Panics
    ///
    /// Panics if `item` belongs to no block this pool has ever owned.
    fn discard_item(&self, item: *const T) {
        self.stats.discards.fetch_add(1, Ordering::Relaxed);
        for block in self.retired.load().iter() {
            if block.contains(item) {
                block.discard_one();
                return;
            }
        }
        panic!("recycled item does not belong to this pool");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small_pool() -> GuardPool<u64> {
        GuardPool::new(PoolConfig {
            base_capacity: 2,
            tl_cache_size: 2,
            row_length: 1,
        })
    }

    #[test]
    fn test_get_never_null_and_distinct() {
        let pool = small_pool();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let item = pool.get();
            assert!(!item.is_null());
            assert!(seen.insert(item as usize), "item handed out twice");
        }
        assert_eq!(pool.stats().gets, 64);
    }

    #[test]
    fn test_items_are_writable_rows() {
        let pool: GuardPool<u32> = GuardPool::new(PoolConfig {
            base_capacity: 4,
            tl_cache_size: 2,
            row_length: 8,
        });
        let row = pool.get();
        for i in 0..8 {
            unsafe { row.add(i).write(i as u32 * 3) };
        }
        for i in 0..8 {
            assert_eq!(unsafe { row.add(i).read() }, i as u32 * 3);
        }
        pool.recycle(row);
    }

    #[test]
    fn test_single_thread_recycle_roundtrip() {
        let pool = small_pool();

        let items: Vec<*mut u64> = (0..4).map(|_| pool.get()).collect();
        for &item in items.iter().rev() {
            pool.recycle(item);
        }

        // With no guard threads the masks clear immediately, so recycling
        // pressure flushes every deferred cache back into circulation.
        let first: HashSet<usize> = items.iter().map(|&p| p as usize).collect();
        let mut reissued = HashSet::new();
        for _ in 0..32 {
            let item = pool.get();
            reissued.insert(item as usize);
            pool.recycle(item);
        }
        assert!(
            first.iter().all(|p| reissued.contains(p)),
            "recycled items were never reissued"
        );
    }

    #[test]
    fn test_block_growth_without_recycling() {
        let pool = small_pool();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(pool.get() as usize));
        }
        let stats = pool.stats();
        // 2 + 4 + ... doubling blocks until 100 items fit.
        assert!(stats.blocks_allocated >= 5);
        assert_eq!(stats.gets, 100);
    }

    #[test]
    fn test_capacity_exhaustion_is_nonfatal() {
        let pool: GuardPool<u64> = GuardPool::new(PoolConfig {
            base_capacity: 1 << 18,
            tl_cache_size: 1 << 18,
            row_length: 1,
        });
        // The base block occupies the last ring slot; no further growth.
        let mut handed = Vec::new();
        loop {
            match pool.try_get() {
                Ok(item) => handed.push(item),
                Err(e) => {
                    assert_eq!(e, PoolError::CapacityExhausted);
                    break;
                }
            }
        }
        assert_eq!(handed.len(), 1 << 18);
        // Still usable at the reached capacity.
        pool.recycle(handed.pop().unwrap());
    }

    #[test]
    fn test_guard_parity() {
        let pool = small_pool();
        let shared = Arc::clone(&pool.shared);

        let lane_values = || -> Vec<u32> {
            shared
                .epochs
                .iter()
                .map(|c| c.load(Ordering::SeqCst))
                .collect()
        };

        assert!(lane_values().iter().all(|&v| v % 2 == 0));
        pool.guard(|| {
            assert_eq!(
                lane_values().iter().filter(|&&v| v % 2 == 1).count(),
                1,
                "exactly one lane odd inside the section"
            );
        });
        assert!(lane_values().iter().all(|&v| v % 2 == 0));
    }

    #[test]
    fn test_guard_returns_value_and_survives_unwind() {
        let pool = small_pool();
        assert_eq!(pool.guard(|| 17), 17);

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.guard(|| panic!("inner"))
        }));
        assert!(caught.is_err());
        // The drop guard closed the section: parity is back to even and a
        // fresh guard works.
        assert_eq!(pool.guard(|| 4), 4);
    }

    #[test]
    fn test_open_guard_on_other_thread_pins_items() {
        use std::sync::mpsc;

        let pool = Arc::new(small_pool());

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let guard_thread = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                pool.guard(|| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
            })
        };
        entered_rx.recv().unwrap();

        // Recycle items while the other thread's section is open.
        let items: Vec<*mut u64> = (0..4).map(|_| pool.get()).collect();
        let pinned: HashSet<usize> = items.iter().map(|&p| p as usize).collect();
        for item in items {
            pool.recycle(item);
        }

        // None of them may come back while the section stays open.
        let mut held = Vec::new();
        for _ in 0..32 {
            let item = pool.get();
            assert!(
                !pinned.contains(&(item as usize)),
                "item reissued under an open guard"
            );
            held.push(item);
        }

        release_tx.send(()).unwrap();
        guard_thread.join().unwrap();

        // After the section closes, recycling pressure flushes them back out.
        for item in held {
            pool.recycle(item);
        }
        let mut reissued = HashSet::new();
        for _ in 0..64 {
            let item = pool.get();
            reissued.insert(item as usize);
            pool.recycle(item);
        }
        assert!(pinned.iter().any(|p| reissued.contains(p)));
    }

    #[test]
    fn test_reset_discards_stale_items() {
        let pool = small_pool();

        let kept = pool.get();
        let blocks_before = pool.stats().blocks_allocated;

        unsafe { pool.unsafe_reset() };

        // The stale item is absorbed by discard accounting, not reissued.
        pool.recycle(kept);
        assert_eq!(pool.stats().discards, 1);

        let mut seen = HashSet::new();
        for _ in 0..16 {
            let item = pool.get();
            assert_ne!(item as usize, kept as usize, "stale item reissued");
            seen.insert(item as usize);
            pool.recycle(item);
        }

        // Reset republished the base block: growth replays as from scratch.
        assert!(pool.stats().blocks_allocated > blocks_before);
    }

    #[test]
    fn test_reset_frees_block_when_fully_discarded() {
        let pool = small_pool();

        // Hold every item of the 2-row base block across the reset.
        let a = pool.get();
        let b = pool.get();

        unsafe { pool.unsafe_reset() };

        pool.recycle(a);
        pool.recycle(b);
        assert_eq!(pool.stats().discards, 2);
        // Both rows of the 2-row block are accounted for; its storage is
        // gone and the next reset prunes its bookkeeping.
        assert!(pool.shared.retired.load().iter().any(|blk| !blk.storage_live()));
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_recycle_foreign_pointer_panics() {
        let pool = small_pool();
        let mut foreign = 0u64;
        pool.recycle(&mut foreign);
    }

    #[test]
    fn test_multi_thread_churn() {
        let pool = Arc::new(GuardPool::<u64>::new(PoolConfig {
            base_capacity: 64,
            tl_cache_size: 4,
            row_length: 1,
        }));

        std::thread::scope(|s| {
            for t in 0..8u64 {
                let pool = Arc::clone(&pool);
                s.spawn(move || {
                    for i in 0..1000 {
                        let item = pool.get();
                        unsafe { item.write(t * 10_000 + i) };
                        let read_back = pool.guard(|| unsafe { item.read() });
                        assert_eq!(read_back, t * 10_000 + i);
                        pool.recycle(item);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.gets, 8000);
        assert_eq!(stats.recycles, 8000);
        assert_eq!(stats.discards, 0);
    }
}
