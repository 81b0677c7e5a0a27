//! The rate limiting engine.
//!
//! [`RateLimitEngine`] ties the rule registry, counter store, block list,
//! attack detector and statistics together. It is an ordinary value: build
//! one per process, wrap it in an `Arc` and hand it to whoever needs it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use super::blocklist::{BlockList, BlockStatus};
use super::counter::{counter_key, LimitInfo};
use super::detector::{AttackDetector, AttackType, Detection, SecurityEvent};
use super::rules::{synthetic_rule_name, RateLimitRule, RuleRegistry, RuleSet};
use super::stats::{block_rate, Stats, StatsSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::error::{BulwarkError, Result};
use crate::store::{CounterStore, MemoryCounterStore};

/// Blocks listed in a stats snapshot.
const STATS_BLOCK_LISTING: usize = 10;

/// A rule breach, handed back to the caller instead of a callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreachEvent {
    /// Breached rule
    pub rule: String,
    /// Identifier that breached it
    pub identifier: String,
    /// Counter state at the breach
    pub limit_info: LimitInfo,
    /// Pattern raised by the rule's escalation, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<AttackType>,
}

/// Decision for a single check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Counter state, when a rule was evaluated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_info: Option<LimitInfo>,
    /// Seconds until a retry can succeed, on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Block reason, when denied by the block list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    /// Breach details, when denied by a rule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach: Option<BreachEvent>,
}

impl CheckResult {
    /// An unconditional allow carrying no counter state.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    fn blocked(status: BlockStatus) -> Self {
        Self {
            allowed: false,
            retry_after: Some(status.retry_after),
            block_reason: Some(status.reason),
            ..Self::default()
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Lapsed block entries removed
    pub blocks_removed: usize,
    /// Expired counter records removed from the store
    pub counters_removed: usize,
}

/// Rate limiting and abuse detection engine.
pub struct RateLimitEngine {
    rules: RuleRegistry,
    store: Arc<dyn CounterStore>,
    blocks: BlockList,
    detector: AttackDetector,
    stats: Stats,
    clock: Arc<dyn Clock>,
}

impl RateLimitEngine {
    /// Create an engine over `store`, seeded with the default rules.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create an engine over `store` that reads time from `clock`.
    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        let rules = RuleRegistry::with_defaults();
        let stats = Stats::new();
        for name in rules.names() {
            stats.track_rule(&name);
        }

        Self {
            rules,
            store,
            blocks: BlockList::new(),
            detector: AttackDetector::new(),
            stats,
            clock,
        }
    }

    /// Create a single-process engine backed by an in-memory store.
    pub fn in_memory() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        Self::with_clock(store, clock)
    }

    /// Current engine time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Check `identifier` against `rule_name` and record the hit.
    ///
    /// Never fails: an unknown rule or an unavailable store allows the
    /// request.
    pub async fn check_limit(
        &self,
        rule_name: &str,
        identifier: &str,
        metadata: Option<serde_json::Value>,
    ) -> CheckResult {
        self.stats.record_request();
        let now = self.clock.now_ms();

        trace!(rule = %rule_name, identifier = %identifier, "Checking rate limit");

        if let Some(status) = self.blocks.check(identifier, now) {
            self.stats.record_blocked();
            debug!(
                identifier = %identifier,
                reason = %status.reason,
                retry_after = status.retry_after,
                "Request denied by block list"
            );
            return CheckResult::blocked(status);
        }

        let Some(rule) = self.rules.get(rule_name) else {
            warn!(rule = %rule_name, "Unknown rate limit rule, allowing request");
            return CheckResult::allow();
        };

        let key = counter_key(&rule.name, identifier);
        let outcome = match self
            .store
            .hit(&key, now, rule.window_ms, rule.max_requests)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    rule = %rule.name,
                    identifier = %identifier,
                    error = %e,
                    "Counter store failure, failing open"
                );
                return CheckResult::allow();
            }
        };

        let counter = outcome.counter;
        let ms_before_next = counter.ms_before_next(now, rule.window_ms);

        if counter.count > rule.max_requests {
            return self.breach(&rule, identifier, counter.count, ms_before_next, metadata, now);
        }

        CheckResult {
            allowed: true,
            limit_info: Some(LimitInfo {
                total_hits: counter.count,
                remaining_points: rule.max_requests - counter.count,
                ms_before_next,
                is_first_in_window: outcome.is_new_window,
                limit: rule.max_requests,
                reset_at: now.saturating_add(ms_before_next),
            }),
            ..CheckResult::default()
        }
    }

    fn breach(
        &self,
        rule: &RateLimitRule,
        identifier: &str,
        count: u64,
        ms_before_next: u64,
        metadata: Option<serde_json::Value>,
        now: u64,
    ) -> CheckResult {
        self.stats.record_blocked();
        self.stats.record_trigger(&rule.name);

        let limit_info = LimitInfo {
            total_hits: count,
            remaining_points: 0,
            ms_before_next,
            is_first_in_window: false,
            limit: rule.max_requests,
            reset_at: now.saturating_add(ms_before_next),
        };

        debug!(
            rule = %rule.name,
            identifier = %identifier,
            count = count,
            limit = rule.max_requests,
            "Rate limit exceeded"
        );

        // The decision is already made; detection below only affects later
        // requests.
        if let Some(attack) = rule.escalation {
            self.detect_potential_attack(
                identifier,
                attack,
                json!({
                    "ruleName": rule.name,
                    "attempts": count,
                    "windowMs": rule.window_ms,
                }),
                now,
            );
        }
        self.detect_potential_attack(
            identifier,
            AttackType::Ddos,
            json!({
                "ruleName": rule.name,
                "count": count,
                "windowMs": rule.window_ms,
                "metadata": metadata,
            }),
            now,
        );

        CheckResult {
            allowed: false,
            limit_info: Some(limit_info.clone()),
            retry_after: Some(ms_before_next.div_ceil(1000)),
            block_reason: None,
            breach: Some(BreachEvent {
                rule: rule.name.clone(),
                identifier: identifier.to_string(),
                limit_info,
                escalation: rule.escalation,
            }),
        }
    }

    fn detect_potential_attack(
        &self,
        identifier: &str,
        attack: AttackType,
        evidence: serde_json::Value,
        now: u64,
    ) -> Option<Detection> {
        let apply_block = |duration_ms: u64, reason: &str| {
            match self.block_identifier(identifier, duration_ms, reason) {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        identifier = %identifier,
                        attack = %attack,
                        error = %e,
                        "Failed to apply automatic block"
                    );
                    false
                }
            }
        };
        let detection = self
            .detector
            .evaluate(identifier, attack, evidence, now, apply_block)?;
        self.stats.record_attack();
        Some(detection)
    }

    /// Signal an attack observed outside rule evaluation, e.g. by a handler
    /// that spotted scraping. Returns the matched pattern, if any.
    pub fn report_attack(
        &self,
        identifier: &str,
        attack: AttackType,
        evidence: serde_json::Value,
    ) -> Option<Detection> {
        self.detect_potential_attack(identifier, attack, evidence, self.clock.now_ms())
    }

    /// Insert or overwrite a rule.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        rule.validate()?;
        self.stats.track_rule(&rule.name);
        if self.rules.insert(rule.clone()) {
            info!(rule = %rule.name, "Added rate limit rule");
        } else {
            info!(rule = %rule.name, "Updated rate limit rule");
        }
        Ok(())
    }

    /// Insert or overwrite every rule in `set`.
    pub fn add_rules(&self, set: RuleSet) -> Result<()> {
        for rule in set.rules {
            self.add_rule(rule)?;
        }
        Ok(())
    }

    /// Register (or reuse) the synthetic rule for an ad hoc limit and return
    /// its name.
    pub fn ensure_synthetic_rule(&self, max_attempts: u64, window_ms: u64) -> Result<String> {
        let name = synthetic_rule_name(max_attempts, window_ms);
        if !self.rules.contains(&name) {
            self.add_rule(RateLimitRule::new(name.clone(), window_ms, max_attempts)?)?;
        }
        Ok(name)
    }

    /// Look up a rule.
    pub fn rule(&self, name: &str) -> Option<RateLimitRule> {
        self.rules.get(name)
    }

    /// All registered rules, sorted by name.
    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.rules.all()
    }

    /// Block `identifier` for `duration_ms`, replacing any existing block.
    pub fn block_identifier(&self, identifier: &str, duration_ms: u64, reason: &str) -> Result<()> {
        if duration_ms == 0 {
            return Err(BulwarkError::InvalidArgument(
                "block duration must be greater than zero".to_string(),
            ));
        }
        if identifier.is_empty() {
            return Err(BulwarkError::InvalidArgument(
                "identifier must not be empty".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(BulwarkError::InvalidArgument(
                "block reason must not be empty".to_string(),
            ));
        }

        let unblock_at = self.clock.now_ms().saturating_add(duration_ms);
        self.blocks.block(identifier, unblock_at, reason);
        warn!(
            identifier = %identifier,
            reason = %reason,
            duration_ms = duration_ms,
            "Identifier blocked"
        );
        Ok(())
    }

    /// Lift any block on `identifier`. Returns whether one existed.
    pub fn unblock_identifier(&self, identifier: &str) -> bool {
        let removed = self.blocks.unblock(identifier);
        if removed {
            info!(identifier = %identifier, "Identifier unblocked");
        }
        removed
    }

    /// The active block on `identifier`, if any.
    pub fn check_blocked(&self, identifier: &str) -> Option<BlockStatus> {
        self.blocks.check(identifier, self.clock.now_ms())
    }

    /// Subscribe to security events.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.detector.subscribe()
    }

    /// Snapshot of the statistics and the longest-running blocks.
    pub fn get_stats(&self) -> StatsSnapshot {
        let now = self.clock.now_ms();
        let total_requests = self.stats.total_requests();
        let blocked_requests = self.stats.blocked_requests();

        StatsSnapshot {
            total_requests,
            blocked_requests,
            attacks_detected: self.stats.attacks_detected(),
            block_rate: block_rate(blocked_requests, total_requests),
            active_blocks: self.blocks.active_count(now),
            rules_triggered: self.stats.rules_triggered(),
            blocked_identifiers: self.blocks.longest_active(now, STATS_BLOCK_LISTING),
        }
    }

    /// Zero the statistics. Blocks are left alone.
    pub fn reset_stats(&self) {
        self.stats.reset(self.rules.names());
        info!("Rate limit statistics reset");
    }

    /// Remove lapsed blocks and expired counter records.
    pub async fn sweep(&self) -> SweepReport {
        let blocks_removed = self.blocks.purge_expired(self.clock.now_ms());
        let counters_removed = match self.store.purge_expired().await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Counter store purge failed");
                0
            }
        };

        if blocks_removed > 0 || counters_removed > 0 {
            debug!(
                blocks_removed = blocks_removed,
                counters_removed = counters_removed,
                "Swept expired rate limit state"
            );
        }
        SweepReport {
            blocks_removed,
            counters_removed,
        }
    }
}

impl Default for RateLimitEngine {
    fn default() -> Self {
        Self::in_memory()
    }
}
