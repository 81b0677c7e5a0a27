//! Fixed-window counter state.
//!
//! A counter lives in the [`CounterStore`](crate::store::CounterStore) under
//! [`counter_key`] with a TTL equal to its rule's window, so abandoned records
//! expire without an explicit rollover.
//!
//! This is a fixed window, not a sliding log. A burst straddling a window
//! boundary can admit up to `2 * max_requests` in the worst case; that is the
//! accepted price of O(1) storage per (rule, identifier).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix of every counter key in the store.
pub const COUNTER_KEY_PREFIX: &str = "ratelimit";

/// Separator between key segments. Rule names may not contain it; the
/// identifier is the last segment, so colons in it (IPv6) stay unambiguous.
pub const KEY_SEPARATOR: char = ':';

/// Build the store key for a (rule, identifier) pair.
pub fn counter_key(rule_name: &str, identifier: &str) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        COUNTER_KEY_PREFIX,
        rule_name,
        identifier,
        sep = KEY_SEPARATOR
    )
}

/// Store TTL for a window: the window length rounded up to whole seconds.
pub fn window_ttl(window_ms: u64) -> Duration {
    Duration::from_secs(window_ms.div_ceil(1000))
}

/// Per (rule, identifier) hit count for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    /// Hits observed in the current window
    pub count: u64,
    /// Epoch milliseconds at which the current window began
    pub window_start: u64,
}

impl WindowCounter {
    /// A fresh window containing a single hit.
    pub fn first_hit(now_ms: u64) -> Self {
        Self {
            count: 1,
            window_start: now_ms,
        }
    }

    /// Whether the window that started at `window_start` is over at `now_ms`.
    pub fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.window_start) >= window_ms
    }

    /// Record one more hit on top of `previous`.
    ///
    /// Returns the new record and whether it opened a new window. A boundary
    /// crossing replaces the record wholesale; it is never partially carried
    /// over.
    pub fn advance(previous: Option<&WindowCounter>, now_ms: u64, window_ms: u64) -> (Self, bool) {
        match previous {
            Some(record) if !record.is_expired(now_ms, window_ms) => (
                Self {
                    count: record.count + 1,
                    window_start: record.window_start,
                },
                false,
            ),
            _ => (Self::first_hit(now_ms), true),
        }
    }

    /// Milliseconds until this window closes.
    pub fn ms_before_next(&self, now_ms: u64, window_ms: u64) -> u64 {
        window_ms.saturating_sub(now_ms.saturating_sub(self.window_start))
    }
}

/// Snapshot of a counter handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitInfo {
    /// Hits counted in the window, including the current one
    pub total_hits: u64,
    /// Hits still admitted before denial
    pub remaining_points: u64,
    /// Milliseconds until the window resets
    pub ms_before_next: u64,
    /// Whether the current hit opened the window
    #[serde(default)]
    pub is_first_in_window: bool,
    /// Threshold of the rule the hit was counted against
    #[serde(default)]
    pub limit: u64,
    /// Epoch milliseconds at which the window resets
    #[serde(default)]
    pub reset_at: u64,
}

/// Result of an atomic hit against the counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitOutcome {
    /// Counter after applying the hit (may exceed the threshold)
    pub counter: WindowCounter,
    /// Whether the hit opened a new window
    pub is_new_window: bool,
    /// Whether the record was written back; false on breach
    pub persisted: bool,
}

impl HitOutcome {
    /// Apply one hit to `previous` and decide whether it may be persisted.
    ///
    /// Store backends call this while holding whatever makes the
    /// read-modify-write atomic for the key.
    pub fn evaluate(
        previous: Option<&WindowCounter>,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> Self {
        let (counter, is_new_window) = WindowCounter::advance(previous, now_ms, window_ms);
        Self {
            counter,
            is_new_window,
            persisted: counter.count <= max_requests,
        }
    }
}
