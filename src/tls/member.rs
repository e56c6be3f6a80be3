// src/tls/member.rs
//! Dynamically-indexed per-thread member variables.
//!
//! # Architecture
//!
//! A [`TlsDomain`] is the shared registry for a family of [`TlsMember`]
//! variables of one type. Creating a member:
//!
//! 1. draws a slot index from the domain's [`IndexPool`] (reusing freed
//!    indices before growing),
//! 2. publishes a *tracker* — the construction value plus an iteration
//!    number drawn from the domain-wide counter — into the tracker array at
//!    that index.
//!
//! Each thread keeps its own value vector addressed by slot index (inline up
//! to four slots, heap beyond) together with the highest iteration it has
//! observed. On access, a thread whose observation is older than the
//! member's iteration *refreshes*: it scans the tracker array and
//! re-materializes every slot whose tracker iteration lies in
//! `(last_seen, member_iteration]` from the tracker's stored init value.
//! Bounding the window this way keeps destroyed-then-reused indices of older
//! generations from being re-materialized, and is how a thread detects that
//! a slot occupant was destroyed and replaced before it ever looked.
//!
//! # Tracker array growth
//!
//! The array grows through a two-phase protocol mediated by a dedicated
//! *swap* slot: a larger array is CAS-installed into the swap slot, unaltered
//! entries of the active array are CAS-copied across (only into still-empty
//! slots, leaving room for concurrent installs to land newer trackers), the
//! swap array is CAS-promoted to active, and the swap slot is then explicitly
//! cleared. Threads that lose any of these races assist and retry.
//!
//! # Concurrency
//!
//! Any number of threads may read and write the same member independently —
//! the values are per-thread, so those accesses need no synchronization with
//! each other. The bookkeeping (index pool, tracker array, iteration
//! counter) is fully lock-free, and the up-to-date access path performs no
//! allocation.

use crate::tls::index_pool::IndexPool;
use arc_swap::ArcSwapOption;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thread_local::ThreadLocal;

/// Number of member slots stored inline in each thread's value vector.
/// Larger indices spill to a heap buffer.
const INLINE_SLOTS: usize = 4;

// ---------------------------------------------------------------------------
// Shared-slot CAS helper
// ---------------------------------------------------------------------------

/// Raw pointer identity of an optional shared handle.
#[inline]
pub(crate) fn opt_ptr<T>(v: &Option<Arc<T>>) -> *const T {
    v.as_ref().map_or(std::ptr::null(), Arc::as_ptr)
}

/// Compare-exchange on an [`ArcSwapOption`] slot, by pointer identity.
/// Returns `true` when `new` was installed.
#[inline]
pub(crate) fn cas_slot<T>(
    slot: &ArcSwapOption<T>,
    expected: &Option<Arc<T>>,
    new: Option<Arc<T>>,
) -> bool {
    let prev = slot.compare_and_swap(expected, new);
    opt_ptr(&*prev) == opt_ptr(expected)
}

// ---------------------------------------------------------------------------
// Trackers
// ---------------------------------------------------------------------------

/// Per-member record: the construction value plus the iteration number that
/// orders this occupancy of the slot against earlier ones.
struct Tracker<T> {
    init: T,
    iteration: AtomicU64,
}

struct TrackerArray<T> {
    slots: Box<[ArcSwapOption<Tracker<T>>]>,
}

impl<T> TrackerArray<T> {
    fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// One thread's materialized member values, addressed by slot index.
struct ThreadValues<T> {
    values: SmallVec<[Option<T>; INLINE_SLOTS]>,
    iteration: u64,
}

impl<T> Default for ThreadValues<T> {
    fn default() -> Self {
        Self {
            values: SmallVec::new(),
            iteration: 0,
        }
    }
}

struct DomainShared<T: Send + Sync> {
    index_pool: IndexPool,
    trackers: ArcSwapOption<TrackerArray<T>>,
    swap: ArcSwapOption<TrackerArray<T>>,
    next_iteration: AtomicU64,
    threads: ThreadLocal<RefCell<ThreadValues<T>>>,
}

// ---------------------------------------------------------------------------
// TlsDomain
// ---------------------------------------------------------------------------

/// Shared registry for a family of [`TlsMember`] variables of type `T`.
///
/// Cloning a domain clones the handle; all clones address the same slot
/// space and the same per-thread storage.
///
/// # Example
///
/// ```rust
/// use guardpool::tls::TlsDomain;
///
/// let domain = TlsDomain::new();
/// let counter = domain.member(0u64);
///
/// counter.set(5);
/// assert_eq!(counter.get(), 5);
/// // Another thread starts from the init value, not from 5.
/// std::thread::scope(|s| {
///     s.spawn(|| assert_eq!(counter.get(), 0)).join().unwrap();
/// });
/// ```
pub struct TlsDomain<T: Clone + Send + Sync + 'static> {
    shared: Arc<DomainShared<T>>,
}

impl<T: Clone + Send + Sync + 'static> TlsDomain<T> {
    /// Creates an empty domain.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DomainShared {
                index_pool: IndexPool::new(),
                trackers: ArcSwapOption::empty(),
                swap: ArcSwapOption::empty(),
                next_iteration: AtomicU64::new(0),
                threads: ThreadLocal::new(),
            }),
        }
    }

    /// Creates a member variable initialized (on every thread that touches
    /// it) from a clone of `init`.
    pub fn member(&self, init: T) -> TlsMember<T> {
        let shared = &self.shared;
        let index = shared.index_pool.get();
        shared.grow_trackers(index as usize + 1);

        let tracker = Arc::new(Tracker {
            init,
            iteration: AtomicU64::new(0),
        });
        shared.install_tracker(index, &tracker);

        // Iteration is assigned after the install so a refresh that races
        // the install skips the slot rather than observing a half-published
        // tracker; the direct-read fallback in `with_value` covers it.
        let iteration = shared.next_iteration.fetch_add(1, Ordering::Relaxed) + 1;
        tracker.iteration.store(iteration, Ordering::Release);

        TlsMember {
            shared: Arc::clone(shared),
            index,
            iteration,
        }
    }

    /// Clears every tracker and returns the index space to its initial
    /// state.
    ///
    /// The domain-wide iteration counter is deliberately *not* rewound:
    /// threads that used the old members keep their high-water observation,
    /// and members created after the reset must out-iterate it for the
    /// refresh window to reach them.
    ///
    /// # Safety
    ///
    /// No member of this domain may be alive and no thread may access the
    /// domain concurrently.
    pub unsafe fn unsafe_reset(&self) {
        self.shared.trackers.store(None);
        self.shared.swap.store(None);
        self.shared.index_pool.unsafe_reset();
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for TlsDomain<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for TlsDomain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> DomainShared<T> {
    /// Two-phase growth of the tracker array to at least `minimum` slots.
    fn grow_trackers(&self, minimum: usize) {
        loop {
            let active = self.trackers.load_full();
            if active.as_ref().map_or(0, |a| a.len()) >= minimum {
                return;
            }

            let mut swap = self.swap.load_full();
            if swap.as_ref().map_or(0, |a| a.len()) < minimum {
                let target = ((minimum as f32) * 1.4) as usize;
                let grown = TrackerArray::with_capacity(target.max(minimum));
                if !cas_slot(&self.swap, &swap, Some(grown)) {
                    continue;
                }
                swap = self.swap.load_full();
                if swap.as_ref().map_or(0, |a| a.len()) < minimum {
                    continue;
                }
            }
            let swap_arr = match &swap {
                Some(a) => Arc::clone(a),
                None => continue,
            };

            // Copy unaltered entries across, but only into still-empty
            // slots: a concurrent install may already have landed a newer
            // tracker there.
            if let Some(act) = &active {
                for (i, slot) in act.slots.iter().enumerate() {
                    if let Some(t) = slot.load_full() {
                        let _ = cas_slot(&swap_arr.slots[i], &None, Some(t));
                    }
                }
            }

            if cas_slot(&self.trackers, &active, Some(Arc::clone(&swap_arr))) {
                // Promotion succeeded; retire the swap slot.
                let _ = cas_slot(&self.swap, &Some(swap_arr), None);
                return;
            }
        }
    }

    /// Stores `tracker` at `index` in the active array — and in the swap
    /// array if a growth is in flight — re-storing until the relation
    /// between the two arrays has stabilized.
    fn install_tracker(&self, index: u32, tracker: &Arc<Tracker<T>>) {
        let index = index as usize;
        loop {
            let active = self.trackers.load_full();
            let swap = self.swap.load_full();

            if let Some(sw) = &swap {
                if index < sw.len() {
                    sw.slots[index].store(Some(Arc::clone(tracker)));
                }
            }
            match &active {
                Some(act) if index < act.len() => {
                    act.slots[index].store(Some(Arc::clone(tracker)));
                }
                // grow_trackers ran first, so a too-small active array means
                // a promotion is mid-flight; retry.
                _ => continue,
            }

            let swap_stable = opt_ptr(&self.swap.load_full()) == opt_ptr(&swap);
            let active_stable = opt_ptr(&self.trackers.load_full()) == opt_ptr(&active);
            if swap_stable && active_stable {
                return;
            }
        }
    }

    fn load_tracker(&self, index: u32) -> Option<Arc<Tracker<T>>> {
        self.trackers
            .load_full()
            .and_then(|arr| arr.slots.get(index as usize).and_then(|s| s.load_full()))
    }
}

// ---------------------------------------------------------------------------
// TlsMember
// ---------------------------------------------------------------------------

/// A member variable with one independent value per accessing thread.
///
/// Each thread's value is lazily constructed from a clone of the init value
/// the member was created with. Reads and writes touch only the calling
/// thread's copy.
///
/// Dropping the member clears its tracker slot and releases its index for
/// reuse by a later member.
pub struct TlsMember<T: Clone + Send + Sync + 'static> {
    shared: Arc<DomainShared<T>>,
    pub(crate) index: u32,
    iteration: u64,
}

impl<T: Clone + Send + Sync + 'static> TlsMember<T> {
    /// Runs `f` on this thread's value.
    ///
    /// Do not call back into the same member from `f`; the thread slot is
    /// exclusively borrowed for the duration of the call.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.with_value(|v| f(v))
    }

    /// Runs `f` on this thread's value, mutably.
    ///
    /// Do not call back into the same member from `f`; the thread slot is
    /// exclusively borrowed for the duration of the call.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.with_value(f)
    }

    /// Returns a clone of this thread's value.
    pub fn get(&self) -> T {
        self.with_value(|v| v.clone())
    }

    /// Replaces this thread's value.
    pub fn set(&self, value: T) {
        self.with_value(|v| *v = value);
    }

    fn with_value<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let cell = self
            .shared
            .threads
            .get_or(|| RefCell::new(ThreadValues::default()));
        let mut tl = cell.borrow_mut();

        if tl.iteration < self.iteration {
            self.refresh(&mut tl);
            tl.iteration = self.iteration;
        }

        let index = self.index as usize;
        while tl.values.len() <= index {
            tl.values.push(None);
        }
        let slot = &mut tl.values[index];
        let value = slot.get_or_insert_with(|| {
            // Refresh raced the tracker's iteration publication; read the
            // init value straight from the tracker instead.
            match self.shared.load_tracker(self.index) {
                Some(t) => t.init.clone(),
                None => panic!("tls member accessed after its tracker was cleared"),
            }
        });
        f(value)
    }

    /// Re-materializes every slot whose occupancy is newer than this
    /// thread's observation but not newer than this member.
    fn refresh(&self, tl: &mut ThreadValues<T>) {
        let Some(arr) = self.shared.trackers.load_full() else {
            return;
        };
        while tl.values.len() < arr.len() {
            tl.values.push(None);
        }
        for (i, slot) in arr.slots.iter().enumerate() {
            if let Some(tracker) = slot.load_full() {
                let it = tracker.iteration.load(Ordering::Acquire);
                if tl.iteration < it && it <= self.iteration {
                    tl.values[i] = Some(tracker.init.clone());
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync + PartialEq + 'static> PartialEq<T> for TlsMember<T> {
    fn eq(&self, other: &T) -> bool {
        self.with(|v| v == other)
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for TlsMember<T> {
    fn drop(&mut self) {
        if let Some(arr) = self.shared.trackers.load_full() {
            if let Some(slot) = arr.slots.get(self.index as usize) {
                slot.store(None);
            }
        }
        self.shared.index_pool.add(self.index);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_init_value() {
        let domain = TlsDomain::new();
        let member = domain.member(41);
        assert_eq!(member.get(), 41);
    }

    #[test]
    fn test_set_get() {
        let domain = TlsDomain::new();
        let member = domain.member(String::from("init"));
        member.set(String::from("changed"));
        assert_eq!(member.get(), "changed");
        assert!(member == String::from("changed"));
    }

    #[test]
    fn test_per_thread_isolation() {
        let domain = TlsDomain::new();
        let member = domain.member(10);
        member.set(99);

        thread::scope(|s| {
            s.spawn(|| {
                // A fresh thread starts from the init value.
                assert_eq!(member.get(), 10);
                member.set(50);
                assert_eq!(member.get(), 50);
            })
            .join()
            .unwrap();
        });

        // The other thread's write did not leak here.
        assert_eq!(member.get(), 99);
    }

    #[test]
    fn test_many_members_spill_inline_storage() {
        let domain = TlsDomain::new();
        let members: Vec<_> = (0..32).map(|i| domain.member(i)).collect();
        for (i, m) in members.iter().enumerate() {
            assert_eq!(m.get(), i);
        }
        for m in &members {
            m.with_mut(|v| *v += 100);
        }
        for (i, m) in members.iter().enumerate() {
            assert_eq!(m.get(), i + 100);
        }
    }

    #[test]
    fn test_index_reuse_after_drop() {
        let domain = TlsDomain::new();
        let first = domain.member(1);
        let first_index = first.index;
        drop(first);
        let second = domain.member(2);
        assert_eq!(second.index, first_index);
        assert_eq!(second.get(), 2);
    }

    #[test]
    fn test_stale_thread_sees_reused_slot_fresh() {
        // A worker thread observes a member, the member is destroyed and its
        // index reused by a new member; the worker must see the new init
        // value, not its stale copy.
        let domain = TlsDomain::<i32>::new();

        let (cmd_tx, cmd_rx) = mpsc::channel::<Arc<TlsMember<i32>>>();
        let (val_tx, val_rx) = mpsc::channel::<i32>();
        let worker = thread::spawn(move || {
            while let Ok(member) = cmd_rx.recv() {
                val_tx.send(member.get()).unwrap();
                drop(member);
            }
        });

        let first = Arc::new(domain.member(5));
        let first_index = first.index;
        cmd_tx.send(Arc::clone(&first)).unwrap();
        assert_eq!(val_rx.recv().unwrap(), 5);

        drop(first);
        let second = Arc::new(domain.member(7));
        assert_eq!(second.index, first_index);

        cmd_tx.send(Arc::clone(&second)).unwrap();
        assert_eq!(val_rx.recv().unwrap(), 7);

        drop(cmd_tx);
        worker.join().unwrap();
    }

    #[test]
    fn test_concurrent_member_creation() {
        let domain = TlsDomain::<usize>::new();
        thread::scope(|s| {
            for t in 0..8 {
                let domain = domain.clone();
                s.spawn(move || {
                    for i in 0..100 {
                        let m = domain.member(t * 1000 + i);
                        assert_eq!(m.get(), t * 1000 + i);
                    }
                });
            }
        });
    }

    #[test]
    fn test_observed_from_many_threads() {
        let domain = TlsDomain::new();
        let member = domain.member(3);
        thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    assert_eq!(member.get(), 3);
                    member.with_mut(|v| *v *= 2);
                    assert_eq!(member.get(), 6);
                });
            }
        });
        assert_eq!(member.get(), 3);
    }
}
