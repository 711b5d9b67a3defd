//! Publish job orchestration for the deviation publisher.
//!
//! This crate turns a queued [`PublishDeviationJob`] into exactly one
//! published deviation:
//!
//! - **Execution lock**: lease on the deviation row, reclaimed when stale
//! - **Rate limiting**: adaptive per-user spacing shared through Redis
//! - **Circuit breaker**: per-user guard against a failing platform
//! - **Error categories**: classification with per-category retry policy
//! - **Workers**: the apalis publish worker and its retry scheduling
//! - **Scheduler**: dispatch of due deviations and stale lease sweeps

pub mod circuit_breaker;
pub mod error;
pub mod error_category;
pub mod execution_lock;
pub mod jobs;
pub mod publisher;
pub mod queue_impl;
pub mod rate_limit;
pub mod redis_store;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod workers;

pub use circuit_breaker::{CircuitBreaker, CircuitState, MemoryCircuitStore, circuit_key};
pub use error::{PublishJobError, StoreError};
pub use error_category::{CategorizedError, ErrorCategory, RetryStrategy, categorize};
pub use execution_lock::ExecutionLockManager;
pub use jobs::*;
pub use publisher::{
    DeviationPublisher, PublishFailure, PublishFile, PublishMode, PublishOutcome, PublishRequest,
};
pub use queue_impl::{CleanupEnqueuer, PublishQueue, RedisJobQueue};
pub use rate_limit::{AdaptiveRateLimiter, MemoryRateLimitStore, RateLimitDecision};
pub use redis_store::{RedisCircuitStore, RedisRateLimitStore};
pub use retry::RetryConfig;
pub use runtime::{KvStores, run_workers};
pub use scheduler::{JobExecutor, PublishJobExecutor, ScheduledJob, SchedulerConfig};
pub use store::{DbPublishStore, PublishCandidate, PublishStore};
pub use workers::*;
