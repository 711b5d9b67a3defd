//! Redis-backed limiter and breaker stores.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{HashesInterface, KeysInterface, LuaInterface};
use fred::types::Expiration;
use tracing::debug;

use crate::circuit_breaker::{CircuitRecord, CircuitStore};
use crate::error::StoreError;
use crate::rate_limit::{RateLimitState, RateLimitStore, SlotOutcome};

/// Check-and-touch for limiter admission.
///
/// KEYS[1] limiter hash, ARGV[1] now (ms), ARGV[2] default delay (ms),
/// ARGV[3] TTL (s). Returns `{1, 0}` when admitted, `{0, wait_ms}` otherwise.
const ACQUIRE_SLOT_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local delay = tonumber(redis.call('HGET', KEYS[1], 'base_delay_ms') or ARGV[2])
local last = tonumber(redis.call('HGET', KEYS[1], 'last_request_ms') or '0')
if last > 0 and now - last < delay then
  return {0, delay - (now - last)}
end
redis.call('HSET', KEYS[1], 'last_request_ms', now)
if redis.call('HEXISTS', KEYS[1], 'base_delay_ms') == 0 then
  redis.call('HSET', KEYS[1], 'base_delay_ms', ARGV[2])
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
return {1, 0}
";

/// Minimum lifetime of a breaker record.
const MIN_CIRCUIT_TTL_SECS: i64 = 3600;

fn field<T: FromStr>(map: &HashMap<String, String>, name: &str) -> Option<T> {
    map.get(name).and_then(|v| v.parse().ok())
}

/// Limiter state in a Redis hash per subject.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    redis: Arc<RedisClient>,
    prefix: String,
    ttl_secs: i64,
}

impl RedisRateLimitStore {
    /// Create a store under `prefix` whose keys expire after `ttl_secs`.
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, prefix: &str, ttl_secs: u64) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            ttl_secs: ttl_secs as i64,
        }
    }

    fn key(&self, subject: &str) -> String {
        format!("{}:rate_limit:{subject}", self.prefix)
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn load(&self, subject: &str) -> Result<Option<RateLimitState>, StoreError> {
        let map: HashMap<String, String> = self
            .redis
            .hgetall(self.key(subject))
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))?;

        let Some(base_delay_ms) = field::<u64>(&map, "base_delay_ms") else {
            return Ok(None);
        };

        Ok(Some(RateLimitState {
            base_delay_ms,
            last_request_ms: field::<i64>(&map, "last_request_ms").filter(|v| *v > 0),
            consecutive_successes: field(&map, "consecutive_successes").unwrap_or(0),
            consecutive_failures: field(&map, "consecutive_failures").unwrap_or(0),
            retry_after_ms: field::<i64>(&map, "retry_after_ms").filter(|v| *v > 0),
        }))
    }

    async fn save_feedback(&self, subject: &str, state: &RateLimitState) -> Result<(), StoreError> {
        let key = self.key(subject);
        let values: HashMap<String, String> = HashMap::from([
            ("base_delay_ms".to_string(), state.base_delay_ms.to_string()),
            (
                "consecutive_successes".to_string(),
                state.consecutive_successes.to_string(),
            ),
            (
                "consecutive_failures".to_string(),
                state.consecutive_failures.to_string(),
            ),
            (
                "retry_after_ms".to_string(),
                state.retry_after_ms.unwrap_or(0).to_string(),
            ),
        ]);

        self.redis
            .hset::<(), _, _>(key.clone(), values)
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))?;
        self.redis
            .expire::<(), _>(key, self.ttl_secs, None)
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))?;

        Ok(())
    }

    async fn try_acquire_slot(
        &self,
        subject: &str,
        now_ms: i64,
        default_delay_ms: u64,
    ) -> Result<SlotOutcome, StoreError> {
        let reply: Vec<i64> = self
            .redis
            .eval(
                ACQUIRE_SLOT_SCRIPT,
                vec![self.key(subject)],
                vec![now_ms, default_delay_ms as i64, self.ttl_secs],
            )
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))?;

        match reply.as_slice() {
            [1, ..] => Ok(SlotOutcome::Acquired),
            [0, wait, ..] => Ok(SlotOutcome::Wait((*wait).max(0) as u64)),
            other => Err(StoreError::Serialization(format!(
                "Unexpected admission reply: {other:?}"
            ))),
        }
    }

    async fn clear(&self, subject: &str) -> Result<(), StoreError> {
        self.redis
            .del::<(), _>(self.key(subject))
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))
    }
}

/// Breaker records as JSON strings with a TTL.
#[derive(Clone)]
pub struct RedisCircuitStore {
    redis: Arc<RedisClient>,
    prefix: String,
    ttl_secs: i64,
}

impl RedisCircuitStore {
    /// Records outlive the open duration many times over, and at least an
    /// hour.
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, prefix: &str, open_duration_secs: u64) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            ttl_secs: (open_duration_secs as i64 * 10).max(MIN_CIRCUIT_TTL_SECS),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:circuit:{key}", self.prefix)
    }
}

#[async_trait]
impl CircuitStore for RedisCircuitStore {
    async fn load(&self, key: &str) -> Result<Option<CircuitRecord>, StoreError> {
        let raw: Option<String> = self
            .redis
            .get(self.key(key))
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn save(&self, key: &str, record: &CircuitRecord) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.redis
            .set::<(), _, _>(
                self.key(key),
                json,
                Some(Expiration::EX(self.ttl_secs)),
                None,
                false,
            )
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))?;

        debug!(key = %key, state = ?record.state, "Saved circuit state");
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.redis
            .del::<(), _>(self.key(key))
            .await
            .map_err(|e| StoreError::Redis(e.to_string()))
    }
}
