//! Relational store seam used by the publish worker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use publisher_common::AppResult;
use publisher_db::entities::deviation::DeviationStatus;
use publisher_db::entities::{automation, deviation, deviation_file, user};
use publisher_db::repositories::{
    AutomationRepository, CommitSummary, DeviationRepository, PublishCommit, UserRepository,
};
use sea_orm::DatabaseConnection;

/// A deviation with everything needed to publish it.
#[derive(Debug, Clone)]
pub struct PublishCandidate {
    /// The deviation row.
    pub deviation: deviation::Model,
    /// Files in sort order.
    pub files: Vec<deviation_file::Model>,
    /// Owning user, if it still exists.
    pub owner: Option<user::Model>,
    /// Automation that scheduled it, if any.
    pub automation: Option<automation::Model>,
}

/// Persistence operations of one publish attempt.
///
/// Lease-guarded writes only apply while `lease_id` is still the record's
/// lease.
#[async_trait]
pub trait PublishStore: Send + Sync {
    /// Take the lease if it is free or older than `stale_before`.
    async fn try_acquire_lease(
        &self,
        deviation_id: &str,
        lease_id: &str,
        stale_before: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Clear the lease if it is still ours.
    async fn release_lease(&self, deviation_id: &str, lease_id: &str) -> AppResult<bool>;

    /// Bump the attempt counter and timestamp.
    async fn record_attempt(&self, deviation_id: &str, lease_id: &str) -> AppResult<()>;

    /// Load the deviation with its files, owner and automation.
    async fn load_candidate(&self, deviation_id: &str) -> AppResult<Option<PublishCandidate>>;

    /// Persist a successful publish atomically.
    async fn commit_published(
        &self,
        deviation_id: &str,
        user_id: &str,
        commit: PublishCommit,
    ) -> AppResult<CommitSummary>;

    /// Let the dispatcher pick a scheduled deviation up again.
    async fn reopen_for_dispatch(&self, deviation_id: &str) -> AppResult<bool>;

    /// Move the deviation back to `status` with a user-facing message.
    async fn revert_status(
        &self,
        deviation_id: &str,
        lease_id: &str,
        status: DeviationStatus,
        message: &str,
    ) -> AppResult<bool>;
}

/// [`PublishStore`] over the `PostgreSQL` repositories.
#[derive(Clone)]
pub struct DbPublishStore {
    deviations: DeviationRepository,
    users: UserRepository,
    automations: AutomationRepository,
}

impl DbPublishStore {
    /// Create a store over a database connection.
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            deviations: DeviationRepository::new(db.clone()),
            users: UserRepository::new(db.clone()),
            automations: AutomationRepository::new(db),
        }
    }
}

#[async_trait]
impl PublishStore for DbPublishStore {
    async fn try_acquire_lease(
        &self,
        deviation_id: &str,
        lease_id: &str,
        stale_before: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.deviations
            .try_acquire_execution_lock(deviation_id, lease_id, stale_before)
            .await
    }

    async fn release_lease(&self, deviation_id: &str, lease_id: &str) -> AppResult<bool> {
        self.deviations
            .release_execution_lock(deviation_id, lease_id)
            .await
    }

    async fn record_attempt(&self, deviation_id: &str, lease_id: &str) -> AppResult<()> {
        self.deviations.record_attempt(deviation_id, lease_id).await
    }

    async fn load_candidate(&self, deviation_id: &str) -> AppResult<Option<PublishCandidate>> {
        let Some(deviation) = self.deviations.find_by_id(deviation_id).await? else {
            return Ok(None);
        };

        let files = self.deviations.find_files(deviation_id).await?;
        let owner = self.users.find_by_id(&deviation.user_id).await?;
        let automation = match deviation.automation_id.as_deref() {
            Some(id) => self.automations.find_by_id(id).await?,
            None => None,
        };

        Ok(Some(PublishCandidate {
            deviation,
            files,
            owner,
            automation,
        }))
    }

    async fn commit_published(
        &self,
        deviation_id: &str,
        user_id: &str,
        commit: PublishCommit,
    ) -> AppResult<CommitSummary> {
        self.deviations
            .commit_published(deviation_id, user_id, commit)
            .await
    }

    async fn reopen_for_dispatch(&self, deviation_id: &str) -> AppResult<bool> {
        self.deviations.reopen_for_dispatch(deviation_id).await
    }

    async fn revert_status(
        &self,
        deviation_id: &str,
        lease_id: &str,
        status: DeviationStatus,
        message: &str,
    ) -> AppResult<bool> {
        self.deviations
            .revert_after_failure(deviation_id, lease_id, status, message)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use publisher_db::test_utils::fixtures;
    use sea_orm::{DatabaseBackend, MockDatabase};

    fn deviation_model(automation_id: Option<&str>) -> deviation::Model {
        let mut dev = fixtures::scheduled_deviation("dev1", "user1");
        dev.automation_id = automation_id.map(ToString::to_string);
        dev
    }

    #[tokio::test]
    async fn test_load_candidate_without_automation() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[deviation_model(None)]])
                .append_query_results([Vec::<deviation_file::Model>::new()])
                .append_query_results([[fixtures::user("user1")]])
                .into_connection(),
        );

        let store = DbPublishStore::new(db);
        let candidate = store.load_candidate("dev1").await.unwrap().unwrap();
        assert!(candidate.files.is_empty());
        assert_eq!(candidate.owner.unwrap().username, "artist_user1");
        assert!(candidate.automation.is_none());
    }

    #[tokio::test]
    async fn test_load_candidate_with_automation() {
        let automation = fixtures::sale_automation("auto1", "user1", Some(2500));
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[deviation_model(Some("auto1"))]])
                .append_query_results([Vec::<deviation_file::Model>::new()])
                .append_query_results([[fixtures::user("user1")]])
                .append_query_results([[automation]])
                .into_connection(),
        );

        let store = DbPublishStore::new(db);
        let candidate = store.load_candidate("dev1").await.unwrap().unwrap();
        assert_eq!(candidate.automation.unwrap().sale_price_cents, Some(2500));
    }

    #[tokio::test]
    async fn test_load_candidate_missing() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<deviation::Model>::new()])
                .into_connection(),
        );

        let store = DbPublishStore::new(db);
        assert!(store.load_candidate("gone").await.unwrap().is_none());
    }
}
