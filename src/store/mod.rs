//! Shared key-value store access.
//!
//! The distributed primitives never read-then-write the store from the
//! client side. Every mutation goes through one of the atomic operations
//! below, executed server-side as a script.

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Script result code: request admitted, window below quota.
pub const CODE_ALLOWED: i64 = 1;
/// Script result code: request admitted, window exactly at quota.
pub const CODE_HIT_QUOTA: i64 = 2;
/// Script result code: request past quota.
pub const CODE_OVER_QUOTA: i64 = 3;

/// Store operations backing the distributed period limiter.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Increment the counter at `key`, attach `expire_secs` on first write,
    /// and compare the new value against `quota`.
    ///
    /// Returns the raw script code; callers map it to a permit state.
    async fn incr_and_check(&self, key: &str, quota: u64, expire_secs: u64) -> Result<i64>;
}

/// Store operations backing the distributed lock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` for `ttl_ms` if unset, or refresh the TTL if it
    /// already holds `token`. Returns whether the lock is now owned.
    async fn acquire(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool>;

    /// Delete `key` only if it holds `token`. Returns whether it was deleted.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}
