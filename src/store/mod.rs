//! Key-value counter stores.
//!
//! The engine only needs get / set-with-TTL / delete plus one atomic
//! read-modify-write primitive ([`CounterStore::hit`]). Two backends ship:
//! [`MemoryCounterStore`] for a single process and [`RedisCounterStore`] for
//! counters shared across instances.

mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::{HitOutcome, WindowCounter};

pub use self::memory::MemoryCounterStore;
pub use self::redis_store::{RedisCounterStore, RedisStoreConfig};

/// Errors raised by counter store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured bound
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    /// A stored record could not be encoded or decoded
    #[error("store record codec error: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A shared associative store for window counters with per-key expiry.
///
/// Implementations must be safe to call from many tasks at once, and must
/// surface unavailability as an error rather than hanging.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the live record for `key`, if any.
    async fn get(&self, key: &str) -> StoreResult<Option<WindowCounter>>;

    /// Write `record` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, record: &WindowCounter, ttl: Duration) -> StoreResult<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically apply one hit to the counter under `key`.
    ///
    /// Rolls the window over when it has elapsed, increments otherwise, and
    /// writes the result back (TTL = window rounded up to seconds) only when
    /// the new count is within `max_requests`. Concurrent hits on the same key
    /// must serialize.
    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> StoreResult<HitOutcome>;

    /// Drop expired records. Backends with native expiry have nothing to do.
    async fn purge_expired(&self) -> StoreResult<usize> {
        Ok(0)
    }
}
