//! Named response caches backing the worker's fetch strategies.
//!
//! Two logical caches exist at runtime: a versioned "static" cache holding
//! shell assets and a "dynamic" cache holding API/page responses. Caches are
//! created lazily on first write and evicted only wholesale, by name, when
//! the version string changes. There is no per-entry TTL.

mod storage;
mod traits;

pub use storage::{MemoryCacheStore, SqliteCacheStore};
pub use traits::{request_key, CacheStore, CachedResponse};
