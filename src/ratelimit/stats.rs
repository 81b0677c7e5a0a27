//! Process-wide request statistics.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::blocklist::BlockedIdentifier;

/// Running counters, reset on a schedule.
///
/// Counters are independent atomics; a snapshot taken during concurrent
/// updates may mix values from slightly different instants.
#[derive(Debug, Default)]
pub struct Stats {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    attacks_detected: AtomicU64,
    rules_triggered: DashMap<String, u64>,
}

impl Stats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one inbound check.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one denied check.
    pub fn record_blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one attack detection.
    pub fn record_attack(&self) {
        self.attacks_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one breach of `rule`.
    pub fn record_trigger(&self, rule: &str) {
        *self.rules_triggered.entry(rule.to_string()).or_insert(0) += 1;
    }

    /// Make sure `rule` has a trigger counter, without touching an existing one.
    pub fn track_rule(&self, rule: &str) {
        self.rules_triggered.entry(rule.to_string()).or_insert(0);
    }

    /// Zero every counter and re-seed the trigger map for `rules`.
    pub fn reset<I, S>(&self, rules: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.total_requests.store(0, Ordering::Relaxed);
        self.blocked_requests.store(0, Ordering::Relaxed);
        self.attacks_detected.store(0, Ordering::Relaxed);
        for mut entry in self.rules_triggered.iter_mut() {
            *entry.value_mut() = 0;
        }
        for rule in rules {
            self.track_rule(rule.as_ref());
        }
    }

    /// Total checks since the last reset.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Denied checks since the last reset.
    pub fn blocked_requests(&self) -> u64 {
        self.blocked_requests.load(Ordering::Relaxed)
    }

    /// Attack detections since the last reset.
    pub fn attacks_detected(&self) -> u64 {
        self.attacks_detected.load(Ordering::Relaxed)
    }

    /// Breach counts by rule name.
    pub fn rules_triggered(&self) -> BTreeMap<String, u64> {
        self.rules_triggered
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Point-in-time view for observability surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Checks since the last reset
    pub total_requests: u64,
    /// Denied checks since the last reset
    pub blocked_requests: u64,
    /// Attack detections since the last reset
    pub attacks_detected: u64,
    /// `blocked_requests / total_requests`, 0 before any request
    pub block_rate: f64,
    /// Blocks currently in force
    pub active_blocks: usize,
    /// Breach counts by rule name
    pub rules_triggered: BTreeMap<String, u64>,
    /// Up to ten active blocks with the furthest expiry
    pub blocked_identifiers: Vec<BlockedIdentifier>,
}

/// Fraction of denied requests, guarding the empty case.
pub fn block_rate(blocked: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        blocked as f64 / total as f64
    }
}
