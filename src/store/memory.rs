//! In-process counter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{CounterStore, StoreResult};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::{window_ttl, HitOutcome, WindowCounter};

#[derive(Debug, Clone, Copy)]
struct StoredCounter {
    record: WindowCounter,
    expires_at: u64,
}

impl StoredCounter {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }
}

/// Counter store backed by a sharded concurrent map.
///
/// `hit` runs under the shard lock of its key, so concurrent hits on one key
/// serialize while hits on other keys proceed in parallel.
pub struct MemoryCounterStore {
    entries: DashMap<String, StoredCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<WindowCounter>> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.record))
    }

    async fn set(&self, key: &str, record: &WindowCounter, ttl: Duration) -> StoreResult<()> {
        let expires_at = self.clock.now_ms().saturating_add(Self::ttl_ms(ttl));
        self.entries.insert(
            key.to_string(),
            StoredCounter {
                record: *record,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> StoreResult<HitOutcome> {
        let ttl_ms = Self::ttl_ms(window_ttl(window_ms));

        let outcome = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = *occupied.get();
                let previous = stored.is_live(now_ms).then_some(&stored.record);
                let outcome = HitOutcome::evaluate(previous, now_ms, window_ms, max_requests);
                if outcome.persisted {
                    occupied.insert(StoredCounter {
                        record: outcome.counter,
                        expires_at: now_ms.saturating_add(ttl_ms),
                    });
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let outcome = HitOutcome::evaluate(None, now_ms, window_ms, max_requests);
                if outcome.persisted {
                    debug!(key = %key, "Creating new window counter");
                    vacant.insert(StoredCounter {
                        record: outcome.counter,
                        expires_at: now_ms.saturating_add(ttl_ms),
                    });
                }
                outcome
            }
        };

        trace!(
            key = %key,
            count = outcome.counter.count,
            persisted = outcome.persisted,
            "Applied counter hit"
        );
        Ok(outcome)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            // Re-check: the key may have been refreshed since the snapshot.
            if self
                .entries
                .remove_if(&key, |_, stored| !stored.is_live(now))
                .is_some()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::assert_ok;

    fn store_at(start_ms: u64) -> (Arc<ManualClock>, MemoryCounterStore) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = MemoryCounterStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (_clock, store) = store_at(0);
        let record = WindowCounter {
            count: 4,
            window_start: 0,
        };

        assert_ok!(store.set("k", &record, Duration::from_secs(10)).await);
        assert_eq!(store.get("k").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_record_expires_after_ttl() {
        let (clock, store) = store_at(0);
        let record = WindowCounter::first_hit(0);
        store.set("k", &record, Duration::from_secs(1)).await.unwrap();

        clock.advance(999);
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(1);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_clock, store) = store_at(0);
        assert_ok!(store.delete("missing").await);

        store
            .set("k", &WindowCounter::first_hit(0), Duration::from_secs(5))
            .await
            .unwrap();
        assert_ok!(store.delete("k").await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_hit_counts_up_to_limit() {
        let (_clock, store) = store_at(0);

        for expected in 1..=3 {
            let outcome = store.hit("k", 10, 60_000, 3).await.unwrap();
            assert_eq!(outcome.counter.count, expected);
            assert!(outcome.persisted);
            assert_eq!(outcome.is_new_window, expected == 1);
        }

        let outcome = store.hit("k", 10, 60_000, 3).await.unwrap();
        assert_eq!(outcome.counter.count, 4);
        assert!(!outcome.persisted);

        // The breach was not written back
        assert_eq!(store.get("k").await.unwrap().map(|r| r.count), Some(3));
    }

    #[tokio::test]
    async fn test_hit_rolls_over_expired_window() {
        let (_clock, store) = store_at(0);
        store.hit("k", 0, 1_000, 5).await.unwrap();
        store.hit("k", 500, 1_000, 5).await.unwrap();

        let outcome = store.hit("k", 1_000, 1_000, 5).await.unwrap();
        assert!(outcome.is_new_window);
        assert_eq!(outcome.counter, WindowCounter::first_hit(1_000));
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_records() {
        let (clock, store) = store_at(0);
        store
            .set("short", &WindowCounter::first_hit(0), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set("long", &WindowCounter::first_hit(0), Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(2_000);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }
}
