// src/lib.rs
//! # Lock-Free Guarded Object Pool
//!
//! Lock-free concurrent building blocks centered on an object pool with
//! guarded (epoch-style) memory reclamation, for recycling the nodes of
//! shared lock-free structures without ever handing a slot back out while a
//! reader could still be looking at it.
//!
//! Three layered components, leaves first:
//!
//! - [`dwcas`] — a 16-byte atomic cell ([`AtomicU128`]) built on the
//!   hardware double-width compare-exchange, with lane-addressed subfield
//!   arithmetic. Versioned-pointer fields built on it defeat ABA.
//! - [`tls`] — per-thread member variables ([`TlsDomain`] / [`TlsMember`]):
//!   an unbounded number of logical variables, each with one lazily
//!   initialized value per accessing thread, indexed through a process-wide
//!   style slot pool.
//! - [`pool`] — the centerpiece: [`GuardPool`] hands out raw item slots from
//!   exponentially growing blocks, recycles them through thread-local
//!   caches, and republishes them only once an epoch scan shows no guarded
//!   reader can still reference them.
//!
//! All operations are lock-free; none of them block on another thread.
//!
//! # Example
//!
//! ```rust
//! use guardpool::prelude::*;
//!
//! let pool: GuardPool<u32> = GuardPool::new(PoolConfig {
//!     base_capacity: 64,
//!     tl_cache_size: 8,
//!     row_length: 1,
//! });
//!
//! let node = pool.get();
//! unsafe { node.write(123) };
//!
//! // Reads of pool-managed shared data belong inside a guard section.
//! let observed = pool.guard(|| unsafe { node.read() });
//! assert_eq!(observed, 123);
//!
//! pool.recycle(node);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_safety_doc)]

pub mod dwcas;
pub mod error;
pub mod pool;
pub mod tls;

// Re-export main types
pub use dwcas::{AtomicU128, U128};
pub use error::{PoolError, Result};
pub use pool::{GuardPool, MAX_USERS, PoolConfig, PoolStats};
pub use tls::{TlsDomain, TlsMember};

/// Commonly used imports.
pub mod prelude {
    pub use crate::dwcas::{AtomicU128, U128};
    pub use crate::error::{PoolError, Result};
    pub use crate::pool::{GuardPool, MAX_USERS, PoolConfig, PoolStats};
    pub use crate::tls::{TlsDomain, TlsMember};
}
