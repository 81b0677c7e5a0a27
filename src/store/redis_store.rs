//! Redis-backed counter store.
//!
//! Lets several engine instances share one counter space. The window update
//! runs as a Lua script so concurrent hits from different instances serialize
//! inside Redis.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{CounterStore, StoreError, StoreResult};
use crate::ratelimit::{window_ttl, HitOutcome, WindowCounter};

const HIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local count = 1
local window_start = now
local is_new = 1

local raw = redis.call('GET', key)
if raw then
  local record = cjson.decode(raw)
  if now - record.window_start < window then
    count = record.count + 1
    window_start = record.window_start
    is_new = 0
  end
end

local persisted = 0
if count <= max then
  redis.call('SET', key, cjson.encode({count = count, window_start = window_start}), 'EX', ttl)
  persisted = 1
end

return {count, window_start, is_new, persisted}
"#;

/// Connection settings for [`RedisCounterStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix prepended to every key
    pub key_prefix: String,
    /// Upper bound on any single command, including connection setup
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "bulwark".to_string(),
            command_timeout: Duration::from_millis(250),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Counter store shared through Redis.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    config: RedisStoreConfig,
    hit_script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis.
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        info!(url = %config.url, prefix = %config.key_prefix, "Connecting to Redis counter store");

        let client = redis::Client::open(config.url.as_str())?;
        let manager = match tokio::time::timeout(
            config.command_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(manager) => manager?,
            Err(_) => return Err(StoreError::Timeout(config.command_timeout)),
        };

        Ok(Self {
            manager,
            config,
            hit_script: Script::new(HIT_SCRIPT),
        })
    }

    fn key_for(&self, key: &str) -> String {
        prefixed_key(&self.config.key_prefix, key)
    }

    async fn bounded<T, F>(&self, command: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, command).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.config.command_timeout)),
        }
    }
}

fn prefixed_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<WindowCounter>> {
        let full_key = self.key_for(key);
        let mut conn = self.manager.clone();

        let raw: Option<String> = self
            .bounded(redis::cmd("GET").arg(&full_key).query_async(&mut conn))
            .await?;

        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn set(&self, key: &str, record: &WindowCounter, ttl: Duration) -> StoreResult<()> {
        let full_key = self.key_for(key);
        let json = serde_json::to_string(record)?;
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.manager.clone();

        let _: () = self
            .bounded(
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(json)
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let full_key = self.key_for(key);
        let mut conn = self.manager.clone();

        let _: i64 = self
            .bounded(redis::cmd("DEL").arg(&full_key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
    ) -> StoreResult<HitOutcome> {
        let full_key = self.key_for(key);
        let ttl_secs = window_ttl(window_ms).as_secs();
        let mut conn = self.manager.clone();

        let mut invocation = self.hit_script.key(&full_key);
        invocation
            .arg(now_ms)
            .arg(window_ms)
            .arg(max_requests)
            .arg(ttl_secs);

        let (count, window_start, is_new, persisted): (u64, u64, i64, i64) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;

        debug!(key = %full_key, count = count, persisted = persisted == 1, "Applied Redis counter hit");

        Ok(HitOutcome {
            counter: WindowCounter {
                count,
                window_start,
            },
            is_new_window: is_new == 1,
            persisted: persisted == 1,
        })
    }
}
