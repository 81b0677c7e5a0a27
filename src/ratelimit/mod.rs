//! Rate limiting logic and state management.

mod blocklist;
mod counter;
mod detector;
mod limiter;
mod rules;
mod scheduler;
mod stats;

pub use blocklist::{BlockEntry, BlockList, BlockStatus, BlockedIdentifier};
pub use counter::{
    counter_key, window_ttl, HitOutcome, LimitInfo, WindowCounter, COUNTER_KEY_PREFIX, KEY_SEPARATOR,
};
pub use detector::{
    attack_patterns, pattern_for, AttackDetector, AttackPattern, AttackType, Detection,
    SecurityEvent, SecurityEventKind, Severity,
};
pub use limiter::{BreachEvent, CheckResult, RateLimitEngine, SweepReport};
pub use rules::{default_rules, synthetic_rule_name, RateLimitRule, RuleRegistry, RuleSet};
pub use scheduler::{SweepSchedule, SweepScheduler};
pub use stats::{Stats, StatsSnapshot};
