//! Versioned key/response cache with offline support.
//!
//! This module provides:
//! - Named, versioned namespaces (one per request class per deployment)
//! - Atomic, last-write-wins entry storage keyed by method + normalized URL
//! - Background writes that later reads of the same key wait for

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, PendingWrite};
pub use storage::{MemoryStore, SqliteStore};
pub use traits::{CacheEntry, CacheNamespace, CacheStore};
