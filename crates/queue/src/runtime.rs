//! Worker process wiring.

use std::sync::Arc;

use apalis::prelude::*;
use apalis_redis::RedisStorage;
use fred::clients::Client as FredClient;
use fred::interfaces::ClientLike;
use publisher_common::Config;
use redis::aio::ConnectionManager;
use sea_orm::DatabaseConnection;
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitStore, MemoryCircuitStore};
use crate::jobs::{PublishDeviationJob, StorageCleanupJob};
use crate::publisher::DeviationPublisher;
use crate::queue_impl::RedisJobQueue;
use crate::rate_limit::{AdaptiveRateLimiter, MemoryRateLimitStore, RateLimitStore};
use crate::redis_store::{RedisCircuitStore, RedisRateLimitStore};
use crate::scheduler::{PublishJobExecutor, SchedulerConfig, run_scheduler};
use crate::store::DbPublishStore;
use crate::workers::{PublishContext, publish_worker};

/// Backing stores for the rate limiter and the circuit breaker.
#[derive(Clone)]
pub struct KvStores {
    /// Limiter state.
    pub rate_limit: Arc<dyn RateLimitStore>,
    /// Breaker state.
    pub circuit: Arc<dyn CircuitStore>,
}

impl KvStores {
    /// Process-local stores.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            rate_limit: Arc::new(MemoryRateLimitStore::new()),
            circuit: Arc::new(MemoryCircuitStore::new()),
        }
    }

    /// Stores shared through Redis.
    #[must_use]
    pub fn redis(client: Arc<FredClient>, config: &Config) -> Self {
        let prefix = config.redis.prefix.as_str();
        Self {
            rate_limit: Arc::new(RedisRateLimitStore::new(
                client.clone(),
                prefix,
                config.rate_limit.state_ttl_secs,
            )),
            circuit: Arc::new(RedisCircuitStore::new(
                client,
                prefix,
                config.circuit_breaker.open_duration_secs,
            )),
        }
    }

    /// Connect to Redis, falling back to process-local stores.
    pub async fn connect(config: &Config) -> Self {
        match connect_fred(&config.redis.url).await {
            Ok(client) => {
                info!("Connected to Redis for rate limiter and circuit breaker state");
                Self::redis(client, config)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-process limiter and breaker state");
                Self::memory()
            }
        }
    }
}

async fn connect_fred(url: &str) -> Result<Arc<FredClient>, fred::error::Error> {
    let fred_config = fred::types::config::Config::from_url(url)?;
    let client = FredClient::new(fred_config, None, None, None);
    client.init().await?;
    Ok(Arc::new(client))
}

/// Run the publish worker and the dispatcher until Ctrl+C.
///
/// `redis` backs the apalis job storages. The limiter and breaker state get
/// their own client, see [`KvStores::connect`].
pub async fn run_workers(
    config: &Config,
    db: Arc<DatabaseConnection>,
    redis: ConnectionManager,
    publisher: Arc<dyn DeviationPublisher>,
) -> anyhow::Result<()> {
    config.validate()?;

    let publish_storage = RedisStorage::<PublishDeviationJob>::new(redis.clone());
    let cleanup_storage = RedisStorage::<StorageCleanupJob>::new(redis);
    let queue = Arc::new(RedisJobQueue::new(publish_storage.clone(), cleanup_storage));

    let stores = KvStores::connect(config).await;
    let rate_limiter = AdaptiveRateLimiter::new(stores.rate_limit, config.rate_limit.clone());
    let breaker = CircuitBreaker::new(stores.circuit, config.circuit_breaker.clone());

    let ctx = PublishContext::new(
        Arc::new(DbPublishStore::new(db.clone())),
        publisher,
        queue.clone(),
        queue.clone(),
        rate_limiter,
        breaker,
        &config.queue,
        &config.execution_lock,
    );

    let executor = Arc::new(PublishJobExecutor::new(
        db,
        queue,
        config.execution_lock.stale_after(),
    ));
    let scheduler = run_scheduler(
        SchedulerConfig::from_config(&config.queue, &config.execution_lock),
        executor,
    );

    let monitor = Monitor::new().register(
        WorkerBuilder::new("publish-deviation")
            .concurrency(config.queue.publish_concurrency)
            .data(ctx)
            .backend(publish_storage)
            .build_fn(publish_worker),
    );

    info!(
        concurrency = config.queue.publish_concurrency,
        "Publish worker started"
    );
    let result = monitor.run_with_signal(tokio::signal::ctrl_c()).await;

    for handle in scheduler {
        handle.abort();
    }
    result?;

    info!("Publish worker stopped");
    Ok(())
}
