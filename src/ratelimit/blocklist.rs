//! Standing blocks that bypass rule evaluation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A standing denial for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEntry {
    /// Epoch milliseconds at which the block lapses
    pub unblock_at: u64,
    /// Short reason code, e.g. `BRUTE_FORCE_DETECTED`
    pub reason: String,
}

/// An active block as seen by a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    /// Whole seconds until the block lapses, rounded up
    pub retry_after: u64,
    /// Reason recorded with the block
    pub reason: String,
}

/// A block entry listed for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedIdentifier {
    /// Blocked identifier
    pub identifier: String,
    /// Reason recorded with the block
    pub reason: String,
    /// Epoch milliseconds at which the block lapses
    pub unblock_at: u64,
    /// Whole seconds remaining
    pub remaining_secs: u64,
}

/// Seconds until `until_ms`, rounded up.
pub(crate) fn secs_until(now_ms: u64, until_ms: u64) -> u64 {
    until_ms.saturating_sub(now_ms).div_ceil(1000)
}

/// In-process block list.
///
/// Entries are removed lazily when a check finds them expired and eagerly by
/// the sweep; an expired entry that has not been swept yet is never treated as
/// blocking.
#[derive(Debug, Default)]
pub struct BlockList {
    entries: DashMap<String, BlockEntry>,
}

impl BlockList {
    /// Create an empty block list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `identifier` until `unblock_at`, replacing any previous entry.
    pub fn block(&self, identifier: &str, unblock_at: u64, reason: &str) {
        self.entries.insert(
            identifier.to_string(),
            BlockEntry {
                unblock_at,
                reason: reason.to_string(),
            },
        );
    }

    /// Remove any block on `identifier`. Returns whether one existed.
    pub fn unblock(&self, identifier: &str) -> bool {
        self.entries.remove(identifier).is_some()
    }

    /// Look up an active block, dropping the entry if it has lapsed.
    pub fn check(&self, identifier: &str, now_ms: u64) -> Option<BlockStatus> {
        let status = {
            let entry = self.entries.get(identifier)?;
            if entry.unblock_at > now_ms {
                Some(BlockStatus {
                    retry_after: secs_until(now_ms, entry.unblock_at),
                    reason: entry.reason.clone(),
                })
            } else {
                None
            }
        };

        if status.is_none() {
            // Re-check under the write lock; a fresh block may have landed.
            if self
                .entries
                .remove_if(identifier, |_, entry| entry.unblock_at <= now_ms)
                .is_some()
            {
                debug!(identifier = %identifier, "Removed expired block");
            }
        }
        status
    }

    /// Raw entry for `identifier`, expired or not.
    pub fn entry(&self, identifier: &str) -> Option<BlockEntry> {
        self.entries.get(identifier).map(|entry| entry.clone())
    }

    /// Number of entries still in force at `now_ms`.
    pub fn active_count(&self, now_ms: u64) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.unblock_at > now_ms)
            .count()
    }

    /// Up to `limit` active blocks, furthest expiry first.
    pub fn longest_active(&self, now_ms: u64, limit: usize) -> Vec<BlockedIdentifier> {
        let mut active: Vec<BlockedIdentifier> = self
            .entries
            .iter()
            .filter(|entry| entry.unblock_at > now_ms)
            .map(|entry| BlockedIdentifier {
                identifier: entry.key().clone(),
                reason: entry.reason.clone(),
                unblock_at: entry.unblock_at,
                remaining_secs: secs_until(now_ms, entry.unblock_at),
            })
            .collect();

        active.sort_by(|a, b| {
            b.unblock_at
                .cmp(&a.unblock_at)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        active.truncate(limit);
        active
    }

    /// Remove every lapsed entry. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.unblock_at <= now_ms)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter(|identifier| {
                self.entries
                    .remove_if(identifier, |_, entry| entry.unblock_at <= now_ms)
                    .is_some()
            })
            .count()
    }

    /// Total entries held, including lapsed ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
