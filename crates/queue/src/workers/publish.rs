//! Publish worker.
//!
//! One run takes the deviation's lease, passes the circuit breaker and the
//! rate limiter, re-reads the record, calls the platform and commits the
//! result in one transaction. The lease is released on every path.

use std::sync::Arc;
use std::time::Duration;

use apalis::prelude::*;
use publisher_common::{ExecutionLockSettings, IdGenerator, QueueConfig};
use publisher_db::entities::deviation::{self, DeviationStatus};
use publisher_db::repositories::{PublishCommit, PublishedItem, SaleListingRequest};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, circuit_key};
use crate::error::PublishJobError;
use crate::error_category::{ErrorCategory, categorize, should_retry};
use crate::execution_lock::ExecutionLockManager;
use crate::jobs::{PublishDeviationJob, StorageCleanupJob};
use crate::publisher::{DeviationPublisher, PublishFailure, PublishOutcome, PublishRequest};
use crate::queue_impl::{CleanupEnqueuer, PublishQueue};
use crate::rate_limit::{AdaptiveRateLimiter, DenyReason};
use crate::retry::RetryConfig;
use crate::store::{PublishCandidate, PublishStore};

/// Outcome of a publish job that did not fail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishJobResult {
    /// Whether the deviation ended up published.
    pub success: bool,
    /// The deviation had been published by an earlier run.
    pub already_published: bool,
    /// Another worker holds the lease.
    pub already_running: bool,
    /// Items on the platform, in file order.
    pub results: Vec<PublishedItem>,
}

impl PublishJobResult {
    fn published(results: Vec<PublishedItem>) -> Self {
        Self {
            success: true,
            results,
            ..Self::default()
        }
    }

    fn already_published(results: Vec<PublishedItem>) -> Self {
        Self {
            success: true,
            already_published: true,
            results,
            ..Self::default()
        }
    }

    fn already_running() -> Self {
        Self {
            success: true,
            already_running: true,
            ..Self::default()
        }
    }
}

/// Context for the publish worker.
#[derive(Clone)]
pub struct PublishContext {
    store: Arc<dyn PublishStore>,
    publisher: Arc<dyn DeviationPublisher>,
    queue: Arc<dyn PublishQueue>,
    cleanup: Arc<dyn CleanupEnqueuer>,
    rate_limiter: AdaptiveRateLimiter,
    breaker: CircuitBreaker,
    locks: ExecutionLockManager,
    retry: RetryConfig,
    job_timeout: Duration,
    id_gen: IdGenerator,
}

impl PublishContext {
    /// Create a new publish context.
    #[must_use]
    pub fn new(
        store: Arc<dyn PublishStore>,
        publisher: Arc<dyn DeviationPublisher>,
        queue: Arc<dyn PublishQueue>,
        cleanup: Arc<dyn CleanupEnqueuer>,
        rate_limiter: AdaptiveRateLimiter,
        breaker: CircuitBreaker,
        queue_config: &QueueConfig,
        lock_settings: &ExecutionLockSettings,
    ) -> Self {
        Self {
            locks: ExecutionLockManager::new(store.clone(), lock_settings.stale_after()),
            store,
            publisher,
            queue,
            cleanup,
            rate_limiter,
            breaker,
            retry: RetryConfig::from(queue_config),
            job_timeout: queue_config.job_timeout(),
            id_gen: IdGenerator::new(),
        }
    }

    /// Run the job and queue its next attempt if it failed retryably.
    pub async fn handle(
        &self,
        job: &PublishDeviationJob,
    ) -> Result<PublishJobResult, PublishJobError> {
        let result = self.process(job).await;

        if let Err(e) = &result {
            if let Some(delay) = e.retry_delay() {
                let next = if e.consumes_attempt() {
                    job.next_attempt()
                } else {
                    job.clone()
                };
                if let Err(err) = self.queue.schedule(next, delay).await {
                    error!(
                        deviation_id = %job.deviation_id,
                        error = %err,
                        "Failed to schedule publish retry"
                    );
                    self.reopen_for_dispatch(&job.deviation_id).await;
                }
            }
        }

        result
    }

    /// Hand a deviation whose retry job was lost back to the dispatcher.
    async fn reopen_for_dispatch(&self, deviation_id: &str) {
        match self.store.reopen_for_dispatch(deviation_id).await {
            Ok(true) => info!(
                deviation_id = %deviation_id,
                "Deviation returned to the dispatcher"
            ),
            Ok(false) => debug!(
                deviation_id = %deviation_id,
                "Deviation no longer scheduled, nothing to reopen"
            ),
            Err(e) => error!(
                deviation_id = %deviation_id,
                error = %e,
                "Failed to reopen deviation, it stays hidden from the dispatcher"
            ),
        }
    }

    /// Run one publish attempt.
    pub async fn process(
        &self,
        job: &PublishDeviationJob,
    ) -> Result<PublishJobResult, PublishJobError> {
        let lease_id = self.id_gen.generate_lease_id();

        if !self.locks.acquire(&job.deviation_id, &lease_id).await {
            info!(
                deviation_id = %job.deviation_id,
                "Deviation is being published by another worker, skipping"
            );
            return Ok(PublishJobResult::already_running());
        }

        let result = self.process_locked(job, &lease_id).await;
        self.locks.release(&job.deviation_id, &lease_id).await;
        result
    }

    async fn process_locked(
        &self,
        job: &PublishDeviationJob,
        lease_id: &str,
    ) -> Result<PublishJobResult, PublishJobError> {
        let deviation_id = job.deviation_id.as_str();
        let key = circuit_key(&job.user_id);

        if !self.breaker.should_allow(&key).await {
            return Err(PublishJobError::CircuitOpen {
                key,
                retry_in: self.breaker.open_duration(),
            });
        }

        let decision = self.rate_limiter.should_allow(&job.user_id).await;
        if !decision.allowed {
            return Err(PublishJobError::RateLimited {
                subject: job.user_id.clone(),
                reason: decision.reason.unwrap_or(DenyReason::MinDelay),
                wait: decision.wait.unwrap_or_default(),
            });
        }

        self.store.record_attempt(deviation_id, lease_id).await?;

        let candidate = self
            .store
            .load_candidate(deviation_id)
            .await?
            .ok_or_else(|| PublishJobError::DeviationNotFound(deviation_id.to_string()))?;

        if let Some(items) = already_published_items(&candidate.deviation) {
            info!(deviation_id = %deviation_id, "Deviation already published");
            return Ok(PublishJobResult::already_published(items));
        }

        let Some(owner_id) = candidate.owner.as_ref().map(|o| o.id.clone()) else {
            return Err(PublishJobError::OwnerNotFound(deviation_id.to_string()));
        };
        if candidate.files.is_empty() {
            return Err(PublishJobError::NoFiles(deviation_id.to_string()));
        }

        let request = PublishRequest::from_candidate(&candidate).with_mode(job.mode);
        debug!(
            deviation_id = %deviation_id,
            mode = ?request.mode,
            files = request.files.len(),
            attempt = job.attempt,
            "Calling publisher"
        );

        let outcome = self
            .breaker
            .execute(
                &key,
                || self.publish_with_timeout(&request),
                |failure| counts_against_circuit(categorize(failure).category),
            )
            .await;

        let items = match outcome {
            Ok(outcome) => outcome.into_items(),
            Err(failure) => return Err(self.fail(job, lease_id, &failure).await),
        };

        let commit = PublishCommit {
            items: items.clone(),
            sale_listing: self.sale_listing(&candidate),
        };
        let summary = match self
            .store
            .commit_published(deviation_id, &owner_id, commit)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                error!(
                    deviation_id = %deviation_id,
                    error = %e,
                    "Published on the platform but failed to record it"
                );
                let failure = PublishFailure::new(e.to_string());
                return Err(self.fail(job, lease_id, &failure).await);
            }
        };

        let cleanup = StorageCleanupJob::new(
            deviation_id.to_string(),
            owner_id,
            candidate.files.iter().map(|f| f.storage_key.clone()).collect(),
        );
        if let Err(e) = self.cleanup.enqueue_cleanup(cleanup).await {
            warn!(deviation_id = %deviation_id, error = %e, "Failed to queue storage cleanup");
        }

        self.rate_limiter.record_success(&job.user_id).await;

        info!(
            deviation_id = %deviation_id,
            items = items.len(),
            post_count_incremented = summary.post_count_incremented,
            sale_listing_created = summary.sale_listing_created,
            "Deviation published"
        );

        Ok(PublishJobResult::published(items))
    }

    async fn publish_with_timeout(
        &self,
        request: &PublishRequest,
    ) -> Result<PublishOutcome, PublishFailure> {
        match tokio::time::timeout(self.job_timeout, self.publisher.publish(request)).await {
            Ok(result) => result,
            Err(_) => Err(PublishFailure::timeout()),
        }
    }

    fn sale_listing(&self, candidate: &PublishCandidate) -> Option<SaleListingRequest> {
        let automation = candidate
            .automation
            .as_ref()
            .filter(|a| a.auto_add_to_sale_queue)?;

        match automation.sale_price_cents {
            Some(price_cents) => Some(SaleListingRequest {
                id: self.id_gen.generate(),
                price_cents,
            }),
            None => {
                warn!(
                    automation_id = %automation.id,
                    "Automation lists for sale but has no price, skipping sale queue"
                );
                None
            }
        }
    }

    /// Feed the failure back into the limiter and move the deviation to its
    /// next status.
    async fn fail(
        &self,
        job: &PublishDeviationJob,
        lease_id: &str,
        failure: &PublishFailure,
    ) -> PublishJobError {
        let categorized = categorize(failure);
        let category = categorized.category;

        warn!(
            deviation_id = %job.deviation_id,
            attempt = job.attempt,
            category = %category,
            status = ?failure.status,
            error = %failure,
            "Publish attempt failed"
        );

        if matches!(category, ErrorCategory::RateLimit | ErrorCategory::QuotaExceeded) {
            self.rate_limiter
                .record_failure(&job.user_id, categorized.retry_after.as_deref())
                .await;
        }

        if categorized.strategy.requires_credential_refresh {
            warn!(user_id = %job.user_id, "Credentials must be refreshed before the next attempt");
        }

        let terminal =
            !should_retry(&categorized, job.attempt) || self.retry.is_final_attempt(job.attempt);
        let status = if terminal {
            DeviationStatus::Draft
        } else {
            DeviationStatus::Scheduled
        };

        match self
            .store
            .revert_status(&job.deviation_id, lease_id, status, category.user_message())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                deviation_id = %job.deviation_id,
                "Lease lost before the failure could be recorded"
            ),
            Err(e) => error!(
                deviation_id = %job.deviation_id,
                error = %e,
                "Failed to record publish failure"
            ),
        }

        if terminal {
            error!(
                deviation_id = %job.deviation_id,
                category = %category,
                "Publishing failed permanently, deviation returned to draft"
            );
        }

        let retry_in = (!terminal).then(|| self.retry.delay_after(&categorized, job.attempt));

        PublishJobError::Publish {
            categorized,
            terminal,
            retry_in,
        }
    }
}

/// Whether a failed publish call says anything about the platform's health.
///
/// A rejected payload is the caller's fault; every other failure counts.
const fn counts_against_circuit(category: ErrorCategory) -> bool {
    !matches!(category, ErrorCategory::ValidationError)
}

/// Items of an earlier successful run, if there was one.
fn already_published_items(deviation: &deviation::Model) -> Option<Vec<PublishedItem>> {
    let published =
        deviation.status == DeviationStatus::Published && deviation.deviation_id.is_some();
    let staged = deviation.stash_only && deviation.stash_item_id.is_some();
    if !published && !staged {
        return None;
    }

    let stored = deviation
        .published_items
        .clone()
        .and_then(|json| serde_json::from_value::<Vec<PublishedItem>>(json).ok())
        .filter(|items| !items.is_empty());

    Some(stored.unwrap_or_else(|| {
        vec![PublishedItem {
            deviation_id: deviation.deviation_id.clone(),
            deviation_url: deviation.deviation_url.clone(),
            stash_item_id: deviation.stash_item_id.clone(),
        }]
    }))
}

/// Worker function for publishing deviations.
///
/// # Errors
/// Returns [`Error::Abort`] for failures that retrying cannot fix and
/// [`Error::Failed`] otherwise. Retries are queued by the worker itself.
pub async fn publish_worker(
    job: PublishDeviationJob,
    ctx: Data<PublishContext>,
) -> Result<(), Error> {
    info!(
        deviation_id = %job.deviation_id,
        user_id = %job.user_id,
        attempt = job.attempt,
        "Publishing deviation"
    );

    match ctx.handle(&job).await {
        Ok(result) => {
            debug!(
                deviation_id = %job.deviation_id,
                already_published = result.already_published,
                already_running = result.already_running,
                "Publish job finished"
            );
            Ok(())
        }
        Err(e) => {
            if e.is_fatal() {
                error!(deviation_id = %job.deviation_id, error = %e, "Publish job aborted");
            } else {
                warn!(deviation_id = %job.deviation_id, error = %e, "Publish job failed");
            }
            Err(e.into_worker_error())
        }
    }
}
