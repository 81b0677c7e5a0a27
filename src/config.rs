//! Configuration management for Bulwark.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional YAML file and `BULWARK__`-prefixed environment variables, e.g.
//! `BULWARK__SERVER__LISTEN_ADDR=0.0.0.0:8080`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::SweepSchedule;
use crate::store::RedisStoreConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BULWARK";

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Engine housekeeping and rules
    #[serde(default)]
    pub engine: EngineConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis settings, used with the `redis` backend
    #[serde(default)]
    pub redis: RedisStoreConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Optional YAML file with extra rules
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Seconds between sweeps of lapsed blocks
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds between statistics resets
    #[serde(default = "default_stats_reset_interval")]
    pub stats_reset_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            sweep_interval_secs: default_sweep_interval(),
            stats_reset_interval_secs: default_stats_reset_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_stats_reset_interval() -> u64 {
    86_400
}

impl EngineConfig {
    /// Scheduler intervals. Zero values fall back to one second.
    pub fn schedule(&self) -> SweepSchedule {
        SweepSchedule {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            stats_reset_interval: Duration::from_secs(self.stats_reset_interval_secs.max(1)),
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl BulwarkConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path, ignoring the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::BulwarkError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BulwarkConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.engine.sweep_interval_secs, 300);
        assert_eq!(config.engine.stats_reset_interval_secs, 86_400);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.engine.rules_path.is_none());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
store:
  backend: redis
  redis:
    url: "redis://cache:6379"
    key_prefix: edge
    command_timeout: 100
logging:
  format: json
"#;
        let config = BulwarkConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis.url, "redis://cache:6379");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.engine.sweep_interval_secs, 300);
    }

    #[test]
    fn test_schedule_from_engine_config() {
        let engine = EngineConfig {
            rules_path: None,
            sweep_interval_secs: 0,
            stats_reset_interval_secs: 60,
        };
        let schedule = engine.schedule();
        assert_eq!(schedule.sweep_interval, Duration::from_secs(1));
        assert_eq!(schedule.stats_reset_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = BulwarkConfig::load(None).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_applies_env_overrides() {
        std::env::set_var("BULWARK__ENGINE__SWEEP_INTERVAL_SECS", "60");
        std::env::set_var("BULWARK__SERVER__LISTEN_ADDR", "0.0.0.0:9999");

        let loaded = BulwarkConfig::load(None);

        std::env::remove_var("BULWARK__ENGINE__SWEEP_INTERVAL_SECS");
        std::env::remove_var("BULWARK__SERVER__LISTEN_ADDR");

        let config = loaded.unwrap();
        assert_eq!(config.engine.sweep_interval_secs, 60);
        assert_eq!(
            config.server.listen_addr,
            "0.0.0.0:9999".parse::<SocketAddr>().unwrap()
        );
        // Untouched keys keep their defaults
        assert_eq!(config.engine.stats_reset_interval_secs, 86_400);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        assert!(matches!(
            BulwarkConfig::from_yaml("server: [unclosed"),
            Err(crate::error::BulwarkError::Config(_))
        ));
    }
}
