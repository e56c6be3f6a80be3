// src/pool/mod.rs
//! Lock-free object pool with guarded (epoch-style) reclamation.
//!
//! See [`GuardPool`] for the full architecture. The submodules split out the
//! pieces: [`config`] the construction parameters, [`stats`] the counters,
//! `block` the storage ring and packed block key, `cache` the item-pointer
//! caches and their queues, `guarded` the pool itself.

pub mod config;
pub mod stats;

mod block;
mod cache;
mod guarded;

pub use config::PoolConfig;
pub use guarded::{GuardPool, MAX_USERS};
pub use stats::PoolStats;
