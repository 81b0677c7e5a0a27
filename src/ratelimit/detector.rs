//! Attack pattern catalog and security events.
//!
//! Detection is deliberately simple: a signal names an [`AttackType`], the
//! static catalog says how severe it is and whether to block. Severity
//! [`Severity::Critical`] additionally produces a
//! [`SecurityEventKind::CriticalAlert`] for out-of-band alerting.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const MINUTE_MS: u64 = 60 * 1_000;

/// Capacity of the security event channel. Slow subscribers lag, they never
/// stall detection.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Abuse categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackType {
    /// Repeated credential guessing
    BruteForce,
    /// Request flooding
    Ddos,
    /// Bulk content harvesting
    Scraping,
    /// Anything else worth a look
    SuspiciousActivity,
}

impl AttackType {
    /// Wire name, e.g. `BRUTE_FORCE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackType::BruteForce => "BRUTE_FORCE",
            AttackType::Ddos => "DDOS",
            AttackType::Scraping => "SCRAPING",
            AttackType::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
        }
    }

    /// Block reason recorded when this attack triggers an automatic block.
    pub fn block_reason(&self) -> String {
        format!("{}_DETECTED", self.as_str())
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a pattern is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackPattern {
    /// Category this entry describes
    pub attack_type: AttackType,
    /// Severity of a detection
    pub severity: Severity,
    /// Whether a detection blocks the identifier
    pub auto_block: bool,
    /// Block length; only meaningful with `auto_block`
    pub block_duration_ms: u64,
}

static PATTERNS: [AttackPattern; 4] = [
    AttackPattern {
        attack_type: AttackType::BruteForce,
        severity: Severity::High,
        auto_block: true,
        block_duration_ms: 30 * MINUTE_MS,
    },
    AttackPattern {
        attack_type: AttackType::Ddos,
        severity: Severity::High,
        auto_block: false,
        block_duration_ms: 0,
    },
    AttackPattern {
        attack_type: AttackType::Scraping,
        severity: Severity::Medium,
        auto_block: true,
        block_duration_ms: 10 * MINUTE_MS,
    },
    AttackPattern {
        attack_type: AttackType::SuspiciousActivity,
        severity: Severity::Critical,
        auto_block: true,
        block_duration_ms: 60 * MINUTE_MS,
    },
];

/// The full static catalog.
pub fn attack_patterns() -> &'static [AttackPattern] {
    &PATTERNS
}

/// Look up the catalog entry for `attack`.
pub fn pattern_for(attack: AttackType) -> Option<&'static AttackPattern> {
    PATTERNS.iter().find(|pattern| pattern.attack_type == attack)
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// A pattern matched
    AttackDetected,
    /// A critical pattern matched; route to on-call alerting
    CriticalAlert,
}

/// Event published for every detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    /// Unique event id
    pub id: Uuid,
    /// Event kind
    pub kind: SecurityEventKind,
    /// Offending identifier
    pub identifier: String,
    /// Matched pattern
    pub attack_type: AttackType,
    /// Pattern severity
    pub severity: Severity,
    /// Whether the identifier was blocked as a result
    pub blocked: bool,
    /// Caller-supplied context; durations in it are milliseconds
    pub evidence: serde_json::Value,
    /// Epoch milliseconds of the detection
    pub detected_at: u64,
}

/// The outcome of a detection the engine must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Matched pattern
    pub pattern: AttackPattern,
    /// Block requested by the pattern, as (duration ms, reason)
    pub block: Option<(u64, String)>,
    /// Whether the requested block took effect
    pub blocked: bool,
}

/// Matches signals against the catalog and fans events out to subscribers.
#[derive(Debug)]
pub struct AttackDetector {
    events: broadcast::Sender<SecurityEvent>,
}

impl AttackDetector {
    /// Create a detector with its own event channel.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { events }
    }

    /// Subscribe to security events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Evaluate a signal. Returns `None` for types without a pattern.
    ///
    /// For auto-blocking patterns `apply_block` is called with the block
    /// duration and reason and reports whether the block took effect. Events
    /// are published afterwards, so their `blocked` flag is what happened.
    pub fn evaluate<F>(
        &self,
        identifier: &str,
        attack: AttackType,
        evidence: serde_json::Value,
        now_ms: u64,
        apply_block: F,
    ) -> Option<Detection>
    where
        F: FnOnce(u64, &str) -> bool,
    {
        let pattern = *pattern_for(attack)?;
        let block = pattern
            .auto_block
            .then(|| (pattern.block_duration_ms, attack.block_reason()));
        let blocked = block
            .as_ref()
            .is_some_and(|(duration_ms, reason)| apply_block(*duration_ms, reason));

        debug!(
            identifier = %identifier,
            attack = %attack,
            severity = ?pattern.severity,
            auto_block = pattern.auto_block,
            blocked = blocked,
            "Attack pattern matched"
        );

        let event = SecurityEvent {
            id: Uuid::new_v4(),
            kind: SecurityEventKind::AttackDetected,
            identifier: identifier.to_string(),
            attack_type: attack,
            severity: pattern.severity,
            blocked,
            evidence,
            detected_at: now_ms,
        };

        if pattern.severity == Severity::Critical {
            warn!(
                identifier = %identifier,
                attack = %attack,
                "Critical security event"
            );
            self.publish(SecurityEvent {
                id: Uuid::new_v4(),
                kind: SecurityEventKind::CriticalAlert,
                ..event.clone()
            });
        }
        self.publish(event);

        Some(Detection {
            pattern,
            block,
            blocked,
        })
    }

    fn publish(&self, event: SecurityEvent) {
        // No subscribers is the normal case outside alerting deployments.
        let _ = self.events.send(event);
    }
}

impl Default for AttackDetector {
    fn default() -> Self {
        Self::new()
    }
}
