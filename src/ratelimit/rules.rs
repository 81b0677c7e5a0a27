//! Rate limit rules and the runtime rule registry.
//!
//! Rules are named (window, threshold) pairs. The registry is seeded with the
//! default catalog at startup and may be extended or overwritten at runtime
//! (admin API, YAML rule files), but rules are never removed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::counter::KEY_SEPARATOR;
use super::detector::AttackType;
use crate::error::{BulwarkError, Result};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;

/// A named rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Unique rule name
    pub name: String,
    /// Window length in milliseconds
    #[serde(alias = "window_ms")]
    pub window_ms: u64,
    /// Hits admitted per window (inclusive)
    #[serde(alias = "max_requests")]
    pub max_requests: u64,
    /// Attack pattern raised once per breach, in addition to the generic
    /// flood signal
    #[serde(default)]
    pub escalation: Option<AttackType>,
}

impl RateLimitRule {
    /// Create a validated rule.
    pub fn new(name: impl Into<String>, window_ms: u64, max_requests: u64) -> Result<Self> {
        let rule = Self {
            name: name.into(),
            window_ms,
            max_requests,
            escalation: None,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Raise `attack` whenever this rule is breached.
    pub fn with_escalation(mut self, attack: AttackType) -> Self {
        self.escalation = Some(attack);
        self
    }

    /// Check the rule's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BulwarkError::InvalidArgument(
                "rule name must not be empty".to_string(),
            ));
        }
        if self.name.contains(KEY_SEPARATOR) {
            return Err(BulwarkError::InvalidArgument(format!(
                "rule {}: name must not contain '{}'",
                self.name, KEY_SEPARATOR
            )));
        }
        if self.window_ms == 0 {
            return Err(BulwarkError::InvalidArgument(format!(
                "rule {}: window_ms must be greater than zero",
                self.name
            )));
        }
        if self.max_requests == 0 {
            return Err(BulwarkError::InvalidArgument(format!(
                "rule {}: max_requests must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// The rules every engine starts with.
pub fn default_rules() -> Vec<RateLimitRule> {
    let rule = |name: &str, window_ms: u64, max_requests: u64| RateLimitRule {
        name: name.to_string(),
        window_ms,
        max_requests,
        escalation: None,
    };

    vec![
        rule("api_general", MINUTE_MS, 100),
        rule("auth_login", 15 * MINUTE_MS, 5).with_escalation(AttackType::BruteForce),
        rule("file_upload", MINUTE_MS, 20),
        rule("sensitive_operations", MINUTE_MS, 10),
        rule("search_api", MINUTE_MS, 60),
        rule("messaging", MINUTE_MS, 30),
    ]
}

/// Name of the synthetic rule shared by every ad hoc (max, window) limit.
pub fn synthetic_rule_name(max_attempts: u64, window_ms: u64) -> String {
    format!("simple_{}_{}", max_attempts, window_ms)
}

/// A set of rules loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    /// Rules in file order
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a bare list of rules or a mapping with a `rules` key.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set = match serde_yaml::from_str::<Vec<RateLimitRule>>(yaml) {
            Ok(rules) => RuleSet { rules },
            Err(_) => serde_yaml::from_str::<RuleSet>(yaml).map_err(|e| {
                BulwarkError::Config(format!("Failed to parse rate limit rules: {}", e))
            })?,
        };

        for rule in &set.rules {
            rule.validate()
                .map_err(|e| BulwarkError::Config(e.to_string()))?;
        }
        Ok(set)
    }
}

/// Runtime registry of rules keyed by name.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, RateLimitRule>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with [`default_rules`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for rule in default_rules() {
            registry.insert(rule);
        }
        registry
    }

    /// Insert or overwrite a rule. Returns true if the name was new.
    pub fn insert(&self, rule: RateLimitRule) -> bool {
        debug!(
            rule = %rule.name,
            window_ms = rule.window_ms,
            max_requests = rule.max_requests,
            "Registering rate limit rule"
        );
        self.rules.write().insert(rule.name.clone(), rule).is_none()
    }

    /// Look up a rule by name.
    pub fn get(&self, name: &str) -> Option<RateLimitRule> {
        self.rules.read().get(name).cloned()
    }

    /// Whether a rule with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.rules.read().contains_key(name)
    }

    /// Names of all registered rules.
    pub fn names(&self) -> Vec<String> {
        self.rules.read().keys().cloned().collect()
    }

    /// All registered rules, sorted by name.
    pub fn all(&self) -> Vec<RateLimitRule> {
        let mut rules: Vec<RateLimitRule> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let registry = RuleRegistry::with_defaults();
        assert_eq!(registry.len(), 6);

        let login = registry.get("auth_login").unwrap();
        assert_eq!(login.window_ms, 15 * 60 * 1000);
        assert_eq!(login.max_requests, 5);
        assert_eq!(login.escalation, Some(AttackType::BruteForce));

        let api = registry.get("api_general").unwrap();
        assert_eq!(api.window_ms, 60_000);
        assert_eq!(api.max_requests, 100);
        assert_eq!(api.escalation, None);

        for name in ["file_upload", "sensitive_operations", "search_api", "messaging"] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_rule_validation() {
        assert!(RateLimitRule::new("ok", 1_000, 1).is_ok());
        assert!(matches!(
            RateLimitRule::new("zero_window", 0, 1),
            Err(BulwarkError::InvalidArgument(_))
        ));
        assert!(matches!(
            RateLimitRule::new("zero_max", 1_000, 0),
            Err(BulwarkError::InvalidArgument(_))
        ));
        assert!(RateLimitRule::new("  ", 1_000, 1).is_err());
        assert!(matches!(
            RateLimitRule::new("login:v2", 1_000, 1),
            Err(BulwarkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_insert_overwrites() {
        let registry = RuleRegistry::new();
        assert!(registry.insert(RateLimitRule::new("r", 1_000, 1).unwrap()));
        assert!(!registry.insert(RateLimitRule::new("r", 2_000, 7).unwrap()));

        let rule = registry.get("r").unwrap();
        assert_eq!(rule.window_ms, 2_000);
        assert_eq!(rule.max_requests, 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_rule_is_none() {
        let registry = RuleRegistry::with_defaults();
        assert!(registry.get("nonexistent_rule").is_none());
    }

    #[test]
    fn test_synthetic_rule_name() {
        assert_eq!(synthetic_rule_name(5, 60_000), "simple_5_60000");
    }

    #[test]
    fn test_parse_rule_list() {
        let yaml = r#"
- name: export_reports
  windowMs: 3600000
  maxRequests: 3
- name: password_reset
  window_ms: 900000
  max_requests: 3
  escalation: BRUTE_FORCE
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].window_ms, 3_600_000);
        assert_eq!(set.rules[1].escalation, Some(AttackType::BruteForce));
    }

    #[test]
    fn test_parse_rules_mapping() {
        let yaml = r#"
rules:
  - name: search_api
    windowMs: 60000
    maxRequests: 120
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.rules[0].max_requests, 120);
    }

    #[test]
    fn test_parse_rejects_invalid_rule() {
        let yaml = r#"
- name: broken
  windowMs: 0
  maxRequests: 3
"#;
        assert!(matches!(
            RuleSet::from_yaml(yaml),
            Err(BulwarkError::Config(_))
        ));
    }
}
