//! Periodic dispatch of due deviations and lease maintenance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use publisher_common::{ExecutionLockSettings, QueueConfig};
use publisher_db::repositories::DeviationRepository;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::jobs::PublishDeviationJob;
use crate::queue_impl::PublishQueue;

type JobResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Scheduled job types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledJob {
    /// Queue publish jobs for scheduled deviations that are due.
    DispatchDueDeviations { batch_size: u64 },
    /// Clear leases left behind by dead workers.
    SweepStaleLeases,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval for dispatching due deviations (default: 30 seconds).
    pub dispatch_interval: Duration,
    /// Maximum deviations dispatched per tick.
    pub dispatch_batch_size: u64,
    /// Interval for the stale lease sweep (default: 5 minutes).
    pub lease_sweep_interval: Duration,
    /// Lease age after which it counts as abandoned.
    pub stale_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default(), &ExecutionLockSettings::default())
    }
}

impl SchedulerConfig {
    /// Build the scheduler configuration from the queue settings.
    #[must_use]
    pub fn from_config(queue: &QueueConfig, locks: &ExecutionLockSettings) -> Self {
        Self {
            dispatch_interval: Duration::from_secs(queue.dispatch_interval_secs.max(1)),
            dispatch_batch_size: queue.dispatch_batch_size,
            lease_sweep_interval: Duration::from_secs(300),
            stale_after: locks.stale_after(),
        }
    }
}

/// Job executor trait for scheduled jobs.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    /// Queue due deviations. Returns how many were queued.
    async fn dispatch_due_deviations(&self, batch_size: u64) -> JobResult<u64>;

    /// Clear leases older than `stale_after`. Returns how many were cleared.
    async fn sweep_stale_leases(&self, stale_after: Duration) -> JobResult<u64>;
}

impl ScheduledJob {
    /// Run this job once.
    pub async fn run<E: JobExecutor + ?Sized>(
        &self,
        executor: &E,
        config: &SchedulerConfig,
    ) -> JobResult<u64> {
        match self {
            Self::DispatchDueDeviations { batch_size } => {
                executor.dispatch_due_deviations(*batch_size).await
            }
            Self::SweepStaleLeases => executor.sweep_stale_leases(config.stale_after).await,
        }
    }
}

/// Run the scheduler with the given configuration and executor.
///
/// Each job gets its own task. The handles are returned so callers can
/// abort them on shutdown.
pub fn run_scheduler<E: JobExecutor + 'static>(
    config: SchedulerConfig,
    executor: Arc<E>,
) -> Vec<JoinHandle<()>> {
    let config = Arc::new(config);
    let jobs = [
        (
            ScheduledJob::DispatchDueDeviations {
                batch_size: config.dispatch_batch_size,
            },
            config.dispatch_interval,
        ),
        (ScheduledJob::SweepStaleLeases, config.lease_sweep_interval),
    ];

    jobs.into_iter()
        .map(|(job, period)| {
            let executor = executor.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let mut interval = interval(period);
                loop {
                    interval.tick().await;
                    match job.run(executor.as_ref(), &config).await {
                        Ok(count) => {
                            if count > 0 {
                                tracing::info!(job = ?job, count, "Scheduled job finished");
                            }
                        }
                        Err(e) => {
                            tracing::error!(job = ?job, error = %e, "Scheduled job failed");
                        }
                    }
                }
            })
        })
        .collect()
}

/// [`JobExecutor`] over the deviation table and the publish queue.
pub struct PublishJobExecutor {
    deviations: DeviationRepository,
    queue: Arc<dyn PublishQueue>,
    stale_after: Duration,
}

impl PublishJobExecutor {
    /// Create a new executor.
    #[must_use]
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn PublishQueue>,
        stale_after: Duration,
    ) -> Self {
        Self {
            deviations: DeviationRepository::new(db),
            queue,
            stale_after,
        }
    }
}

fn stale_before(stale_after: Duration) -> chrono::DateTime<Utc> {
    let age = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
}

#[async_trait::async_trait]
impl JobExecutor for PublishJobExecutor {
    async fn dispatch_due_deviations(&self, batch_size: u64) -> JobResult<u64> {
        let due = self
            .deviations
            .find_due_for_publishing(Utc::now(), stale_before(self.stale_after), batch_size)
            .await?;

        let mut queued = 0;
        for deviation in due {
            let job = PublishDeviationJob::new(deviation.id.clone(), deviation.user_id.clone());
            match self.queue.enqueue(job).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    tracing::warn!(
                        deviation_id = %deviation.id,
                        error = %e,
                        "Failed to dispatch deviation"
                    );
                }
            }
        }

        Ok(queued)
    }

    async fn sweep_stale_leases(&self, stale_after: Duration) -> JobResult<u64> {
        Ok(self.deviations.clear_stale_locks(stale_before(stale_after)).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use publisher_common::AppResult;
    use publisher_db::entities::deviation;
    use publisher_db::test_utils::fixtures;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[derive(Default)]
    struct CountingExecutor {
        dispatches: AtomicU64,
        sweeps: AtomicU64,
    }

    #[async_trait::async_trait]
    impl JobExecutor for CountingExecutor {
        async fn dispatch_due_deviations(&self, _batch_size: u64) -> JobResult<u64> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        async fn sweep_stale_leases(&self, _stale_after: Duration) -> JobResult<u64> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Err("database unavailable".into())
        }
    }

    #[derive(Default)]
    struct RecordingQueue {
        jobs: Mutex<Vec<PublishDeviationJob>>,
    }

    #[async_trait::async_trait]
    impl PublishQueue for RecordingQueue {
        async fn enqueue(&self, job: PublishDeviationJob) -> AppResult<()> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }

        async fn schedule(&self, job: PublishDeviationJob, _delay: Duration) -> AppResult<()> {
            self.enqueue(job).await
        }
    }

    fn due(id: &str) -> deviation::Model {
        fixtures::scheduled_deviation(id, "user1")
    }

    #[test]
    fn test_scheduler_config_from_queue_config() {
        let queue = QueueConfig {
            dispatch_interval_secs: 10,
            dispatch_batch_size: 25,
            ..QueueConfig::default()
        };
        let locks = ExecutionLockSettings { stale_after_secs: 900 };

        let config = SchedulerConfig::from_config(&queue, &locks);
        assert_eq!(config.dispatch_interval, Duration::from_secs(10));
        assert_eq!(config.dispatch_batch_size, 25);
        assert_eq!(config.stale_after, Duration::from_secs(900));
    }

    #[test]
    fn test_zero_dispatch_interval_is_clamped() {
        let queue = QueueConfig {
            dispatch_interval_secs: 0,
            ..QueueConfig::default()
        };
        let config = SchedulerConfig::from_config(&queue, &ExecutionLockSettings::default());
        assert_eq!(config.dispatch_interval, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_keeps_running_after_errors() {
        let executor = Arc::new(CountingExecutor::default());
        let config = SchedulerConfig {
            dispatch_interval: Duration::from_secs(30),
            dispatch_batch_size: 10,
            lease_sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
        };

        let handles = run_scheduler(config, executor.clone());
        tokio::time::sleep(Duration::from_secs(125)).await;

        // Ticks at 0, 30, 60, 90, 120 and 0, 60, 120
        assert_eq!(executor.dispatches.load(Ordering::SeqCst), 5);
        assert_eq!(executor.sweeps.load(Ordering::SeqCst), 3);

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_dispatch_queues_first_attempts() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([vec![due("dev1"), due("dev2")]])
                .into_connection(),
        );
        let queue = Arc::new(RecordingQueue::default());
        let executor = PublishJobExecutor::new(db, queue.clone(), Duration::from_secs(600));

        let queued = executor.dispatch_due_deviations(10).await.unwrap();
        assert_eq!(queued, 2);

        let jobs = queue.jobs.lock().unwrap();
        assert_eq!(jobs[0], PublishDeviationJob::new("dev1".to_string(), "user1".to_string()));
        assert_eq!(jobs[1].deviation_id, "dev2");
        assert_eq!(jobs[1].attempt, 1);
    }

    #[tokio::test]
    async fn test_sweep_reports_cleared_leases() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 3,
                }])
                .into_connection(),
        );
        let queue = Arc::new(RecordingQueue::default());
        let executor = PublishJobExecutor::new(db, queue, Duration::from_secs(600));

        let cleared = executor.sweep_stale_leases(Duration::from_secs(600)).await.unwrap();
        assert_eq!(cleared, 3);
    }
}
