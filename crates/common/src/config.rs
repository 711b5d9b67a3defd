//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::AppError;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Job queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Adaptive rate limiter configuration.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Circuit breaker configuration.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Execution lock configuration.
    #[serde(default)]
    pub execution_lock: ExecutionLockSettings,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Publish queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Concurrent publish tasks per worker process.
    #[serde(default = "default_publish_concurrency")]
    pub publish_concurrency: usize,
    /// Attempt ceiling for a publish job, including the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on a single external publish call.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// How often due scheduled deviations are dispatched.
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,
    /// Maximum deviations dispatched per tick.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            publish_concurrency: default_publish_concurrency(),
            max_attempts: default_max_attempts(),
            job_timeout_secs: default_job_timeout_secs(),
            dispatch_interval_secs: default_dispatch_interval_secs(),
            dispatch_batch_size: default_dispatch_batch_size(),
        }
    }
}

impl QueueConfig {
    /// Job timeout as a [`Duration`].
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// Adaptive rate limiter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Whether the limiter is active at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Starting spacing between requests for a fresh subject.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Lower bound for the adaptive spacing.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Upper bound for the adaptive spacing.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive successes needed before the spacing shrinks.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Multiplier applied to the spacing after sustained success (< 1).
    #[serde(default = "default_success_decrease_factor")]
    pub success_decrease_factor: f64,
    /// Multiplier applied to the spacing after a failure (> 1).
    #[serde(default = "default_failure_increase_factor")]
    pub failure_increase_factor: f64,
    /// Jitter applied by `wait_time`, in percent.
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u32,
    /// TTL of the persisted per-subject state.
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_base_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            success_threshold: default_success_threshold(),
            success_decrease_factor: default_success_decrease_factor(),
            failure_increase_factor: default_failure_increase_factor(),
            jitter_percent: default_jitter_percent(),
            state_ttl_secs: default_state_ttl_secs(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call.
    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration_secs(),
        }
    }
}

/// Execution lock settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionLockSettings {
    /// Age after which a held lease may be reclaimed by another worker.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for ExecutionLockSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl ExecutionLockSettings {
    /// Staleness threshold as a [`Duration`].
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_redis_prefix() -> String {
    "publisher".to_string()
}

const fn default_publish_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_job_timeout_secs() -> u64 {
    10 * 60
}

const fn default_dispatch_interval_secs() -> u64 {
    30
}

const fn default_dispatch_batch_size() -> u64 {
    50
}

const fn default_true() -> bool {
    true
}

const fn default_base_delay_ms() -> u64 {
    3_000
}

const fn default_min_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    300_000
}

const fn default_success_threshold() -> u32 {
    3
}

const fn default_success_decrease_factor() -> f64 {
    0.9
}

const fn default_failure_increase_factor() -> f64 {
    2.0
}

const fn default_jitter_percent() -> u32 {
    20
}

const fn default_state_ttl_secs() -> u64 {
    24 * 60 * 60
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_open_duration_secs() -> u64 {
    60
}

const fn default_stale_after_secs() -> u64 {
    30 * 60
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `PUBLISHER_ENV`)
    /// 4. Environment variables with `PUBLISHER__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("PUBLISHER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("PUBLISHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PUBLISHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// A lease must outlive the longest legitimate publish call, otherwise a
    /// slow job could have its lease reclaimed while it is still running.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.execution_lock.stale_after_secs <= self.queue.job_timeout_secs {
            return Err(AppError::Config(format!(
                "execution_lock.stale_after_secs ({}) must exceed queue.job_timeout_secs ({})",
                self.execution_lock.stale_after_secs, self.queue.job_timeout_secs
            )));
        }

        let rl = &self.rate_limit;
        if rl.min_delay_ms > rl.max_delay_ms {
            return Err(AppError::Config(format!(
                "rate_limit.min_delay_ms ({}) exceeds rate_limit.max_delay_ms ({})",
                rl.min_delay_ms, rl.max_delay_ms
            )));
        }
        if rl.success_decrease_factor <= 0.0 || rl.success_decrease_factor >= 1.0 {
            return Err(AppError::Config(
                "rate_limit.success_decrease_factor must be in (0, 1)".to_string(),
            ));
        }
        if rl.failure_increase_factor <= 1.0 {
            return Err(AppError::Config(
                "rate_limit.failure_increase_factor must be greater than 1".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(AppError::Config(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
