//! Redis-backed window store for multi-process deployments.
//!
//! Each window is a sorted set of admission timestamps scored by time. The
//! prune, count and append run inside one Lua script, which Redis evaluates
//! atomically, so concurrent processes see the same linearizable behavior as
//! the in-process store. Keys expire one window after their last admission,
//! so no sweeper is needed.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::backend::WindowBackend;
use super::policy::Policy;
use super::window::{Decision, WindowKey};
use crate::error::{Result, TollgateError};

/// Default prefix for window keys.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:";

/// KEYS[1] window key; ARGV: now_ms, window_ms, limit, member.
/// Returns {admitted, remaining, retry_after_ms}.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

if now >= window then
  redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
end

local count = redis.call('ZCARD', key)
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  return {1, limit - count - 1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry = 0
if oldest[2] then
  retry = tonumber(oldest[2]) + window - now
  if retry < 0 then
    retry = 0
  end
end
return {0, 0, retry}
"#;

/// Window store shared through Redis.
pub struct RedisWindowStore {
    connection: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            TollgateError::Config(format!("invalid redis url '{}': {}", url, e))
        })?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| TollgateError::BackendUnavailable(e.to_string()))?;

        let key_prefix = key_prefix.into();
        info!(key_prefix = %key_prefix, "Connected to redis window store");

        Ok(Self {
            connection,
            script: Script::new(ADMIT_SCRIPT),
            key_prefix,
        })
    }

    /// The Redis key for a window.
    fn redis_key(&self, key: &WindowKey) -> String {
        redis_key(&self.key_prefix, key)
    }
}

fn redis_key(prefix: &str, key: &WindowKey) -> String {
    format!("{}{}|{}", prefix, key.policy, key.client)
}

/// Sorted-set members must be unique even for equal timestamps.
fn member(now_ms: u64) -> String {
    format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple())
}

fn decode(reply: &[i64]) -> Result<Decision> {
    match reply {
        [1, remaining, _] => Ok(Decision::admit((*remaining).max(0) as u64)),
        [0, _, retry] => Ok(Decision::deny((*retry).max(0) as u64)),
        other => Err(TollgateError::BackendUnavailable(format!(
            "unexpected admit script reply: {:?}",
            other
        ))),
    }
}

#[async_trait]
impl WindowBackend for RedisWindowStore {
    async fn admit(&self, key: &WindowKey, policy: &Policy, now_ms: u64) -> Result<Decision> {
        let redis_key = self.redis_key(key);
        let mut connection = self.connection.clone();

        let reply: Vec<i64> = self
            .script
            .key(&redis_key)
            .arg(now_ms)
            .arg(policy.window_ms)
            .arg(policy.limit)
            .arg(member(now_ms))
            .invoke_async(&mut connection)
            .await
            .map_err(|e| TollgateError::BackendUnavailable(e.to_string()))?;

        let decision = decode(&reply)?;
        debug!(key = %redis_key, admitted = decision.admitted, "Redis window checked");
        Ok(decision)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
