//! TTL and tag-addressable cache.
//!
//! [`CacheManager`] stores JSON envelopes in a [`CacheStore`] (Redis in
//! production, [`MemoryStore`] for tests and single-node setups) and keeps a
//! `tag -> keys` index next to them so related entries can be dropped in one
//! call. Every read path soft-fails: a backend outage looks like a miss.
//!
//! There is no stampede protection. Concurrent misses on the same key all
//! run their fetch and the last write wins.

pub mod manager;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use {
    manager::{CacheEntry, CacheManager, CacheOptions, CacheStats},
    memory::MemoryStore,
    redis_store::RedisStore,
    store::CacheStore,
};
