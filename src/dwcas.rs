// src/dwcas.rs
//! 128-bit atomic cell built on the hardware double-width compare-exchange.
//!
//! # Architecture
//!
//! Every operation — including plain loads and stores — funnels through a
//! single `lock cmpxchg16b` instruction, so a 16-byte value can never be
//! observed torn even though the CPU offers no native 128-bit load.
//! A [`load`](AtomicU128::load) is a compare-exchange of the cell against a
//! snapshot of itself: if the snapshot was stale the instruction rewrites it
//! with the real contents, atomically either way.
//!
//! On top of the full-width operations, [`AtomicU128`] supports
//! *lane-addressed* read-modify-write: the 16 bytes are viewed as lanes of
//! width 1, 2, 4 or 8 bytes, and `swap`/`fetch_add`/`fetch_sub` on a single
//! lane is a CAS loop that copies the current value, mutates only the
//! addressed lane and retries until the exchange lands. The return value is
//! always the *pre-operation* snapshot of the whole cell.
//!
//! # Platform support
//!
//! Requires `cmpxchg16b`. Construction fails fast on CPUs without it — there
//! is no emulated fallback, since emulation could not keep the no-tearing
//! guarantee.

use crate::error::{PoolError, Result};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;

// ---------------------------------------------------------------------------
// U128 value type
// ---------------------------------------------------------------------------

/// A 16-byte, 16-byte-aligned plain value, the unit of exchange of
/// [`AtomicU128`].
///
/// The `lo` half occupies bytes 0..8, `hi` bytes 8..16. Lane accessors
/// address the same 16 bytes as arrays of narrower unsigned integers in
/// memory order, matching what the lane-addressed atomic operations mutate.
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct U128 {
    /// Bytes 0..8.
    pub lo: u64,
    /// Bytes 8..16.
    pub hi: u64,
}

/// Marker for the integer widths addressable as lanes of a [`U128`].
pub trait Lane: Copy + private::Sealed {}

impl Lane for u8 {}
impl Lane for u16 {}
impl Lane for u32 {}
impl Lane for u64 {}

mod private {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

impl U128 {
    /// Creates a value from its low and high halves.
    #[inline]
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// The all-zero value.
    #[inline]
    pub const fn zero() -> Self {
        Self { lo: 0, hi: 0 }
    }

    /// Reads the lane of width `size_of::<L>()` at `lane`.
    ///
    /// # Panics
    ///
    /// Panics if `lane * size_of::<L>() >= 16`.
    #[inline]
    pub fn lane<L: Lane>(&self, lane: u8) -> L {
        let offset = lane_offset::<L>(lane);
        // SAFETY: offset + size_of::<L>() <= 16 (checked above) and the
        // offset is a multiple of the lane width, so the pointer is in
        // bounds and aligned.
        unsafe { *((self as *const U128 as *const u8).add(offset) as *const L) }
    }

    /// Overwrites the lane of width `size_of::<L>()` at `lane`.
    ///
    /// # Panics
    ///
    /// Panics if `lane * size_of::<L>() >= 16`.
    #[inline]
    pub fn set_lane<L: Lane>(&mut self, lane: u8, value: L) {
        let offset = lane_offset::<L>(lane);
        // SAFETY: as in `lane`.
        unsafe { *((self as *mut U128 as *mut u8).add(offset) as *mut L) = value }
    }
}

/// Byte offset of lane `lane` of width `L`, validated against the cell size.
#[inline]
fn lane_offset<L: Lane>(lane: u8) -> usize {
    let scaled = lane as usize * mem::size_of::<L>();
    assert!(
        scaled < 16,
        "lane index out of bounds: lane {} of width {}",
        lane,
        mem::size_of::<L>()
    );
    scaled
}

impl From<u128> for U128 {
    #[inline]
    fn from(v: u128) -> Self {
        Self {
            lo: v as u64,
            hi: (v >> 64) as u64,
        }
    }
}

impl From<U128> for u128 {
    #[inline]
    fn from(v: U128) -> Self {
        (v.hi as u128) << 64 | v.lo as u128
    }
}

impl fmt::Debug for U128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U128 {{ lo: {:#018x}, hi: {:#018x} }}", self.lo, self.hi)
    }
}

// ---------------------------------------------------------------------------
// AtomicU128
// ---------------------------------------------------------------------------

/// A 16-byte atomic cell.
///
/// All operations are sequentially consistent with respect to the cell.
///
/// # Example
///
/// ```rust
/// use guardpool::dwcas::{AtomicU128, U128};
///
/// let cell = AtomicU128::new(U128::new(1, 2));
/// let prev = cell.fetch_add_u32(10, 0);
/// assert_eq!(prev.lane::<u32>(0), 1);
/// assert_eq!(cell.load().lane::<u32>(0), 11);
/// ```
pub struct AtomicU128 {
    storage: UnsafeCell<U128>,
}

// SAFETY: every access to `storage` goes through the lock-prefixed
// compare-exchange; no mixed-width or non-atomic access exists.
unsafe impl Send for AtomicU128 {}
unsafe impl Sync for AtomicU128 {}

impl AtomicU128 {
    /// Creates a cell holding `value`.
    ///
    /// # Panics
    ///
    /// Panics if the CPU does not support a 16-byte compare-exchange.
    /// Use [`try_new`](Self::try_new) for a fallible check.
    pub fn new(value: U128) -> Self {
        match Self::try_new(value) {
            Ok(cell) => cell,
            Err(e) => panic!("{}", e),
        }
    }

    /// Creates a cell holding `value`, or fails if the platform lacks a
    /// 16-byte compare-exchange. There is no emulated fallback.
    pub fn try_new(value: U128) -> Result<Self> {
        if !dwcas_supported() {
            return Err(PoolError::DwcasUnsupported);
        }
        Ok(Self {
            storage: UnsafeCell::new(value),
        })
    }

    /// Atomically loads the cell.
    ///
    /// Implemented as a compare-exchange of (snapshot, snapshot): the
    /// snapshot read below may tear, but the exchange then either confirms
    /// it or rewrites it with the true contents.
    #[inline]
    pub fn load(&self) -> U128 {
        // SAFETY: the potentially-torn read is repaired by the CAS.
        let mut expected = unsafe { std::ptr::read_volatile(self.storage.get()) };
        let desired = expected;
        self.cas(&mut expected, desired);
        expected
    }

    /// Atomically stores `value`.
    #[inline]
    pub fn store(&self, value: U128) {
        let mut expected = self.load();
        while !self.cas(&mut expected, value) {}
    }

    /// Atomically replaces the cell contents, returning the previous value.
    #[inline]
    pub fn swap(&self, value: U128) -> U128 {
        let mut expected = self.load();
        while !self.cas(&mut expected, value) {}
        expected
    }

    /// Strong compare-exchange. On failure `expected` is rewritten with the
    /// observed contents.
    #[inline]
    pub fn compare_exchange(&self, expected: &mut U128, desired: U128) -> bool {
        self.cas(expected, desired)
    }

    /// CAS loop mutating a single lane; returns the pre-operation snapshot
    /// of the whole cell.
    #[inline]
    fn lane_rmw<L: Lane>(&self, lane: u8, f: impl Fn(L) -> L) -> U128 {
        // Validate the lane before touching the cell, so an out-of-range
        // index fails fast without a partial operation.
        let _ = lane_offset::<L>(lane);

        let mut expected = self.load();
        loop {
            let mut desired = expected;
            desired.set_lane::<L>(lane, f(desired.lane::<L>(lane)));
            if self.cas(&mut expected, desired) {
                return expected;
            }
        }
    }
}

macro_rules! lane_ops {
    ($ty:ty, $swap_fn:ident, $add_fn:ident, $sub_fn:ident, $width:literal) => {
        impl AtomicU128 {
            #[doc = concat!("Atomically replaces the ", $width, "-bit lane `lane`, returning the previous value of the whole cell.")]
            ///
            /// # Panics
            ///
            /// Panics if the lane index is out of range.
            #[inline]
            pub fn $swap_fn(&self, value: $ty, lane: u8) -> U128 {
                self.lane_rmw::<$ty>(lane, move |_| value)
            }

            #[doc = concat!("Atomically adds `value` (wrapping) to the ", $width, "-bit lane `lane`, returning the previous value of the whole cell.")]
            ///
            /// # Panics
            ///
            /// Panics if the lane index is out of range.
            #[inline]
            pub fn $add_fn(&self, value: $ty, lane: u8) -> U128 {
                self.lane_rmw::<$ty>(lane, move |cur| cur.wrapping_add(value))
            }

            #[doc = concat!("Atomically subtracts `value` (wrapping) from the ", $width, "-bit lane `lane`, returning the previous value of the whole cell.")]
            ///
            /// # Panics
            ///
            /// Panics if the lane index is out of range.
            #[inline]
            pub fn $sub_fn(&self, value: $ty, lane: u8) -> U128 {
                self.lane_rmw::<$ty>(lane, move |cur| cur.wrapping_sub(value))
            }
        }
    };
}

lane_ops!(u8, swap_u8, fetch_add_u8, fetch_sub_u8, "8");
lane_ops!(u16, swap_u16, fetch_add_u16, fetch_sub_u16, "16");
lane_ops!(u32, swap_u32, fetch_add_u32, fetch_sub_u32, "32");
lane_ops!(u64, swap_u64, fetch_add_u64, fetch_sub_u64, "64");

impl Default for AtomicU128 {
    fn default() -> Self {
        Self::new(U128::zero())
    }
}

impl fmt::Debug for AtomicU128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicU128").field(&self.load()).finish()
    }
}

// ---------------------------------------------------------------------------
// Hardware compare-exchange
// ---------------------------------------------------------------------------

/// Whether this CPU can execute a 16-byte compare-exchange.
#[cfg(target_arch = "x86_64")]
pub fn dwcas_supported() -> bool {
    std::is_x86_feature_detected!("cmpxchg16b")
}

/// Whether this CPU can execute a 16-byte compare-exchange.
#[cfg(not(target_arch = "x86_64"))]
pub fn dwcas_supported() -> bool {
    false
}

impl AtomicU128 {
    #[cfg(target_arch = "x86_64")]
    #[inline]
    fn cas(&self, expected: &mut U128, desired: U128) -> bool {
        let ok: u8;
        // SAFETY: `storage` is 16-byte aligned (U128 is align(16)) and
        // `try_new` verified cmpxchg16b support. rbx is reserved by LLVM, so
        // it is swapped out around the instruction.
        unsafe {
            core::arch::asm!(
                "xchg {save}, rbx",
                "lock cmpxchg16b [{dst}]",
                "setz {ok}",
                "mov rbx, {save}",
                dst = in(reg) self.storage.get(),
                save = inout(reg) desired.lo => _,
                ok = out(reg_byte) ok,
                inout("rax") expected.lo,
                inout("rdx") expected.hi,
                in("rcx") desired.hi,
                options(nostack),
            );
        }
        ok != 0
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline]
    fn cas(&self, _expected: &mut U128, _desired: U128) -> bool {
        // try_new refuses construction without hardware support.
        unreachable!("AtomicU128 constructed on a platform without DWCAS")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
