//! Job queue seams and their apalis-redis implementation.

use std::time::Duration;

use apalis::prelude::Storage;
use apalis_redis::RedisStorage;
use async_trait::async_trait;
use chrono::Utc;
use publisher_common::{AppError, AppResult};
use tracing::{debug, info};

use crate::jobs::{PublishDeviationJob, StorageCleanupJob};

/// Queue of publish jobs.
#[async_trait]
pub trait PublishQueue: Send + Sync {
    /// Queue a job to run as soon as a worker is free.
    async fn enqueue(&self, job: PublishDeviationJob) -> AppResult<()>;

    /// Queue a job to run after `delay`.
    async fn schedule(&self, job: PublishDeviationJob, delay: Duration) -> AppResult<()>;
}

/// Hands published deviations over to storage cleanup.
#[async_trait]
pub trait CleanupEnqueuer: Send + Sync {
    /// Queue removal of a published deviation's files.
    async fn enqueue_cleanup(&self, job: StorageCleanupJob) -> AppResult<()>;
}

/// Redis-backed job queue.
#[derive(Clone)]
pub struct RedisJobQueue {
    publish: RedisStorage<PublishDeviationJob>,
    cleanup: RedisStorage<StorageCleanupJob>,
}

impl RedisJobQueue {
    /// Create a queue over the given apalis storages.
    #[must_use]
    pub const fn new(
        publish: RedisStorage<PublishDeviationJob>,
        cleanup: RedisStorage<StorageCleanupJob>,
    ) -> Self {
        Self { publish, cleanup }
    }
}

#[async_trait]
impl PublishQueue for RedisJobQueue {
    async fn enqueue(&self, job: PublishDeviationJob) -> AppResult<()> {
        let deviation_id = job.deviation_id.clone();

        self.publish
            .clone()
            .push(job)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to queue publish job: {e}")))?;

        debug!(deviation_id = %deviation_id, "Queued publish job");
        Ok(())
    }

    async fn schedule(&self, job: PublishDeviationJob, delay: Duration) -> AppResult<()> {
        let deviation_id = job.deviation_id.clone();
        let attempt = job.attempt;
        let run_at = Utc::now().timestamp() + delay.as_secs().max(1) as i64;

        self.publish
            .clone()
            .schedule(job, run_at)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to schedule publish job: {e}")))?;

        info!(
            deviation_id = %deviation_id,
            attempt,
            delay_secs = delay.as_secs(),
            "Scheduled publish retry"
        );
        Ok(())
    }
}

#[async_trait]
impl CleanupEnqueuer for RedisJobQueue {
    async fn enqueue_cleanup(&self, job: StorageCleanupJob) -> AppResult<()> {
        let deviation_id = job.deviation_id.clone();

        self.cleanup
            .clone()
            .push(job)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to queue cleanup job: {e}")))?;

        debug!(deviation_id = %deviation_id, "Queued storage cleanup job");
        Ok(())
    }
}
