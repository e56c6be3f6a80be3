// src/tls/mod.rs
//! Per-thread storage for dynamic collections of logical variables.
//!
//! A [`TlsDomain`] hands out slot indices from a lock-free index pool and
//! tracks one [`TlsMember`] per live index. Every thread that touches a
//! member lazily
//! materializes its own copy of the member's value, and an iteration counter
//! lets threads detect that a slot was destroyed and reused before they
//! observed the change.

pub(crate) mod index_pool;
pub(crate) mod member;

pub use member::{TlsDomain, TlsMember};
