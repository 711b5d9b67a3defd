//! Deviation repository.

use std::sync::Arc;

use crate::entities::deviation::DeviationStatus;
use crate::entities::sale_queue::SaleQueueStatus;
use crate::entities::{
    Deviation, DeviationFile, SaleQueue, User, deviation, deviation_file, sale_queue, user,
};
use chrono::{DateTime, Utc};
use publisher_common::{AppError, AppResult};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DatabaseTransaction, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
    sea_query::{Expr, OnConflict},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One post created on the external platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedItem {
    /// External deviation ID, when the item was finalized.
    pub deviation_id: Option<String>,
    /// External deviation URL.
    pub deviation_url: Option<String>,
    /// External stash item ID.
    pub stash_item_id: Option<String>,
}

/// Sale queue entry requested by the owning automation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleListingRequest {
    /// Row ID for the new entry.
    pub id: String,
    /// Asking price in cents.
    pub price_cents: i32,
}

/// Everything written when a publish succeeds.
#[derive(Debug, Clone)]
pub struct PublishCommit {
    /// Items returned by the external call, in file order. The first one
    /// populates the record's own identifier columns.
    pub items: Vec<PublishedItem>,
    /// Sale queue entry to insert alongside, if the automation asks for one.
    pub sale_listing: Option<SaleListingRequest>,
}

/// What the commit transaction actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    /// The owner's post counter was bumped by this commit.
    pub post_count_incremented: bool,
    /// A sale queue entry was created by this commit.
    pub sale_listing_created: bool,
}

/// Deviation repository for database operations.
#[derive(Clone)]
pub struct DeviationRepository {
    db: Arc<DatabaseConnection>,
}

impl DeviationRepository {
    /// Create a new deviation repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find a deviation by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<deviation::Model>> {
        Deviation::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Get a deviation by ID, returning an error if not found.
    pub async fn get_by_id(&self, id: &str) -> AppResult<deviation::Model> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| AppError::DeviationNotFound(id.to_string()))
    }

    /// Create a new deviation.
    pub async fn create(&self, model: deviation::ActiveModel) -> AppResult<deviation::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Attach a file to a deviation.
    pub async fn add_file(
        &self,
        model: deviation_file::ActiveModel,
    ) -> AppResult<deviation_file::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Files of a deviation in publish order.
    pub async fn find_files(&self, deviation_id: &str) -> AppResult<Vec<deviation_file::Model>> {
        DeviationFile::find()
            .filter(deviation_file::Column::DeviationId.eq(deviation_id))
            .order_by_asc(deviation_file::Column::SortOrder)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Scheduled deviations whose time has come and that nobody is working on.
    ///
    /// Records attempted since they were scheduled already have a retry job
    /// queued and are skipped.
    pub async fn find_due_for_publishing(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u64,
    ) -> AppResult<Vec<deviation::Model>> {
        Deviation::find()
            .filter(deviation::Column::Status.eq(DeviationStatus::Scheduled))
            .filter(deviation::Column::ScheduledAt.lte(now))
            .filter(Self::lease_free_or_stale(stale_before))
            .filter(
                Condition::any()
                    .add(deviation::Column::LastRetryAt.is_null())
                    .add(
                        Expr::col(deviation::Column::LastRetryAt)
                            .lt(Expr::col(deviation::Column::ScheduledAt)),
                    ),
            )
            .order_by_asc(deviation::Column::ScheduledAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    // ==================== Execution Lease ====================

    /// Stamp `lease_id` on the deviation if no live lease is held.
    ///
    /// Returns `false` when another lease is held and is newer than
    /// `stale_before`. The check and the write are one statement.
    pub async fn try_acquire_execution_lock(
        &self,
        id: &str,
        lease_id: &str,
        stale_before: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = Deviation::update_many()
            .col_expr(deviation::Column::ExecutionLockId, Expr::value(lease_id))
            .col_expr(deviation::Column::ExecutionLockedAt, Expr::value(Utc::now()))
            .filter(deviation::Column::Id.eq(id))
            .filter(Self::lease_free_or_stale(stale_before))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Clear the lease if it is still `lease_id`.
    ///
    /// Returns `false` when the lease had already been reclaimed.
    pub async fn release_execution_lock(&self, id: &str, lease_id: &str) -> AppResult<bool> {
        let result = Deviation::update_many()
            .col_expr(
                deviation::Column::ExecutionLockId,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                deviation::Column::ExecutionLockedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(deviation::Column::Id.eq(id))
            .filter(deviation::Column::ExecutionLockId.eq(lease_id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Clear every lease older than `stale_before`.
    pub async fn clear_stale_locks(&self, stale_before: DateTime<Utc>) -> AppResult<u64> {
        let result = Deviation::update_many()
            .col_expr(
                deviation::Column::ExecutionLockId,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                deviation::Column::ExecutionLockedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(deviation::Column::ExecutionLockId.is_not_null())
            .filter(deviation::Column::ExecutionLockedAt.lt(stale_before))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected)
    }

    fn lease_free_or_stale(stale_before: DateTime<Utc>) -> Condition {
        Condition::any()
            .add(deviation::Column::ExecutionLockId.is_null())
            .add(deviation::Column::ExecutionLockedAt.is_null())
            .add(deviation::Column::ExecutionLockedAt.lt(stale_before))
    }

    // ==================== Publish Lifecycle ====================

    /// Bump the attempt counter while `lease_id` is held. Status is untouched.
    pub async fn record_attempt(&self, id: &str, lease_id: &str) -> AppResult<()> {
        let now = Utc::now();

        let result = Deviation::update_many()
            .col_expr(
                deviation::Column::RetryCount,
                Expr::col(deviation::Column::RetryCount).add(1),
            )
            .col_expr(deviation::Column::LastRetryAt, Expr::value(now))
            .col_expr(deviation::Column::UpdatedAt, Expr::value(now))
            .filter(deviation::Column::Id.eq(id))
            .filter(deviation::Column::ExecutionLockId.eq(lease_id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if result.rows_affected == 0 {
            debug!(deviation_id = %id, "Attempt not recorded, lease no longer held");
        }

        Ok(())
    }

    /// Make a scheduled deviation visible to the due scan again.
    ///
    /// Clears the attempt timestamp that hides records waiting for a retry
    /// job. Used when that retry job could not be queued.
    pub async fn reopen_for_dispatch(&self, id: &str) -> AppResult<bool> {
        let result = Deviation::update_many()
            .col_expr(
                deviation::Column::LastRetryAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(deviation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(deviation::Column::Id.eq(id))
            .filter(deviation::Column::Status.eq(DeviationStatus::Scheduled))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Move a deviation back to `status` with a user-facing error message.
    ///
    /// Guarded by `lease_id` so a worker that lost its lease cannot clobber
    /// the state written by the new owner.
    pub async fn revert_after_failure(
        &self,
        id: &str,
        lease_id: &str,
        status: DeviationStatus,
        error_message: &str,
    ) -> AppResult<bool> {
        let result = Deviation::update_many()
            .col_expr(deviation::Column::Status, Expr::value(status))
            .col_expr(
                deviation::Column::ErrorMessage,
                Expr::value(Some(error_message.to_string())),
            )
            .col_expr(deviation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(deviation::Column::Id.eq(id))
            .filter(deviation::Column::ExecutionLockId.eq(lease_id))
            .filter(deviation::Column::Status.ne(DeviationStatus::Published))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Persist a successful publish in one transaction.
    ///
    /// Marks the deviation published, bumps the owner's post counter at most
    /// once per deviation, and adds a sale queue entry when requested. A
    /// failing sale queue insert is rolled back to a savepoint and does not
    /// fail the commit.
    pub async fn commit_published(
        &self,
        id: &str,
        user_id: &str,
        commit: PublishCommit,
    ) -> AppResult<CommitSummary> {
        let now = Utc::now();
        let primary = commit.items.first().cloned();
        let items = serde_json::to_value(&commit.items)
            .map_err(|e| AppError::Internal(format!("Failed to encode published items: {e}")))?;

        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let updated = Deviation::update_many()
            .col_expr(deviation::Column::Status, Expr::value(DeviationStatus::Published))
            .col_expr(
                deviation::Column::DeviationId,
                Expr::value(primary.as_ref().and_then(|i| i.deviation_id.clone())),
            )
            .col_expr(
                deviation::Column::DeviationUrl,
                Expr::value(primary.as_ref().and_then(|i| i.deviation_url.clone())),
            )
            .col_expr(
                deviation::Column::StashItemId,
                Expr::value(primary.as_ref().and_then(|i| i.stash_item_id.clone())),
            )
            .col_expr(deviation::Column::PublishedItems, Expr::value(items))
            .col_expr(deviation::Column::PublishedAt, Expr::value(now))
            .col_expr(
                deviation::Column::ErrorMessage,
                Expr::value(Option::<String>::None),
            )
            .col_expr(deviation::Column::UpdatedAt, Expr::value(now))
            .filter(deviation::Column::Id.eq(id))
            .exec(&txn)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if updated.rows_affected == 0 {
            return Err(AppError::DeviationNotFound(id.to_string()));
        }

        // Only the statement that flips the flag may bump the counter
        let flagged = Deviation::update_many()
            .col_expr(deviation::Column::PostCountIncremented, Expr::value(true))
            .filter(deviation::Column::Id.eq(id))
            .filter(deviation::Column::PostCountIncremented.eq(false))
            .exec(&txn)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let post_count_incremented = flagged.rows_affected == 1;
        if post_count_incremented {
            User::update_many()
                .col_expr(user::Column::PostCount, Expr::col(user::Column::PostCount).add(1))
                .col_expr(user::Column::UpdatedAt, Expr::value(now))
                .filter(user::Column::Id.eq(user_id))
                .exec(&txn)
                .await
                .map_err(|e| AppError::Database(e.to_string()))?;
        }

        let mut sale_listing_created = false;
        if let Some(listing) = commit.sale_listing {
            match Self::insert_sale_listing(&txn, id, user_id, listing).await {
                Ok(created) => sale_listing_created = created,
                Err(e) => {
                    warn!(deviation_id = %id, error = %e, "Failed to add deviation to sale queue");
                }
            }
        }

        txn.commit()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(CommitSummary {
            post_count_incremented,
            sale_listing_created,
        })
    }

    async fn insert_sale_listing(
        txn: &DatabaseTransaction,
        deviation_id: &str,
        user_id: &str,
        listing: SaleListingRequest,
    ) -> Result<bool, DbErr> {
        let savepoint = txn.begin().await?;

        let existing = SaleQueue::find()
            .filter(sale_queue::Column::DeviationId.eq(deviation_id))
            .one(&savepoint)
            .await?;
        if existing.is_some() {
            savepoint.commit().await?;
            return Ok(false);
        }

        let model = sale_queue::ActiveModel {
            id: Set(listing.id),
            user_id: Set(user_id.to_string()),
            deviation_id: Set(deviation_id.to_string()),
            price_cents: Set(listing.price_cents),
            status: Set(SaleQueueStatus::Pending),
            created_at: Set(Utc::now().into()),
        };

        let inserted = SaleQueue::insert(model)
            .on_conflict(
                OnConflict::column(sale_queue::Column::DeviationId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&savepoint)
            .await;

        let created = match inserted {
            Ok(rows) => rows > 0,
            // Duplicate key: someone else already listed it
            Err(DbErr::RecordNotInserted) => false,
            Err(e) => return Err(e),
        };

        savepoint.commit().await?;
        Ok(created)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entities::deviation::UploadMode;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};
    use serde_json::json;

    fn exec(rows_affected: u64) -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected,
        }
    }

    fn create_test_deviation(id: &str, user_id: &str) -> deviation::Model {
        deviation::Model {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: "Sunset study".to_string(),
            description: None,
            tags: json!(["painting"]),
            status: DeviationStatus::Scheduled,
            upload_mode: UploadMode::Single,
            stash_only: false,
            automation_id: None,
            scheduled_at: Some(Utc::now().into()),
            deviation_id: None,
            deviation_url: None,
            stash_item_id: None,
            published_items: None,
            published_at: None,
            error_message: None,
            retry_count: 0,
            last_retry_at: None,
            post_count_incremented: false,
            execution_lock_id: None,
            execution_locked_at: None,
            created_at: Utc::now().into(),
            updated_at: None,
        }
    }

    fn create_test_file(id: &str, deviation_id: &str, sort_order: i32) -> deviation_file::Model {
        deviation_file::Model {
            id: id.to_string(),
            deviation_id: deviation_id.to_string(),
            storage_key: format!("uploads/{id}.png"),
            original_filename: format!("{id}.png"),
            mime_type: "image/png".to_string(),
            file_size: 1024,
            sort_order,
            created_at: Utc::now().into(),
        }
    }

    fn item(id: &str) -> PublishedItem {
        PublishedItem {
            deviation_id: Some(id.to_string()),
            deviation_url: Some(format!("https://example.com/art/{id}")),
            stash_item_id: None,
        }
    }

    #[tokio::test]
    async fn test_find_by_id() {
        let dev = create_test_deviation("dev1", "user1");
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[dev.clone()]])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let result = repo.find_by_id("dev1").await.unwrap();
        assert_eq!(result.unwrap().id, "dev1");
    }

    #[tokio::test]
    async fn test_get_by_id_not_found() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<deviation::Model>::new()])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let result = repo.get_by_id("missing").await;
        assert!(matches!(result, Err(AppError::DeviationNotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_find_files() {
        let files = vec![
            create_test_file("f1", "dev1", 0),
            create_test_file("f2", "dev1", 1),
        ];
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([files])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let result = repo.find_files("dev1").await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "f1");
    }

    #[tokio::test]
    async fn test_acquire_lock_succeeds_when_row_updated() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(1)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let acquired = repo
            .try_acquire_execution_lock("dev1", "lease-a", Utc::now())
            .await
            .unwrap();
        assert!(acquired);
    }

    #[tokio::test]
    async fn test_acquire_lock_denied_when_no_row_updated() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(0)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let acquired = repo
            .try_acquire_execution_lock("dev1", "lease-b", Utc::now())
            .await
            .unwrap();
        assert!(!acquired);
    }

    #[tokio::test]
    async fn test_reopen_for_dispatch_only_touches_scheduled_rows() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(1), exec(0)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        assert!(repo.reopen_for_dispatch("dev1").await.unwrap());
        assert!(!repo.reopen_for_dispatch("published").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_lock_reports_reclaimed_lease() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(1), exec(0)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        assert!(repo.release_execution_lock("dev1", "lease-a").await.unwrap());
        assert!(!repo.release_execution_lock("dev1", "lease-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_published_bumps_counter_and_lists_for_sale() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                // deviation update, counter flag, user counter, sale queue insert
                .append_exec_results([exec(1), exec(1), exec(1), exec(1)])
                .append_query_results([Vec::<sale_queue::Model>::new()])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let summary = repo
            .commit_published(
                "dev1",
                "user1",
                PublishCommit {
                    items: vec![item("ext-1")],
                    sale_listing: Some(SaleListingRequest {
                        id: "sale1".to_string(),
                        price_cents: 500,
                    }),
                },
            )
            .await
            .unwrap();

        assert!(summary.post_count_incremented);
        assert!(summary.sale_listing_created);
    }

    #[tokio::test]
    async fn test_commit_published_does_not_double_count() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                // deviation update succeeds, counter flag was already set
                .append_exec_results([exec(1), exec(0)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let summary = repo
            .commit_published(
                "dev1",
                "user1",
                PublishCommit {
                    items: vec![item("ext-1")],
                    sale_listing: None,
                },
            )
            .await
            .unwrap();

        assert!(!summary.post_count_incremented);
        assert!(!summary.sale_listing_created);
    }

    #[tokio::test]
    async fn test_commit_published_skips_existing_sale_listing() {
        let existing = sale_queue::Model {
            id: "sale0".to_string(),
            user_id: "user1".to_string(),
            deviation_id: "dev1".to_string(),
            price_cents: 500,
            status: SaleQueueStatus::Pending,
            created_at: Utc::now().into(),
        };
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(1), exec(1), exec(1)])
                .append_query_results([[existing]])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let summary = repo
            .commit_published(
                "dev1",
                "user1",
                PublishCommit {
                    items: vec![item("ext-1")],
                    sale_listing: Some(SaleListingRequest {
                        id: "sale1".to_string(),
                        price_cents: 500,
                    }),
                },
            )
            .await
            .unwrap();

        assert!(summary.post_count_incremented);
        assert!(!summary.sale_listing_created);
    }

    #[tokio::test]
    async fn test_commit_published_missing_deviation() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(0)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let result = repo
            .commit_published(
                "gone",
                "user1",
                PublishCommit {
                    items: vec![item("ext-1")],
                    sale_listing: None,
                },
            )
            .await;

        assert!(matches!(result, Err(AppError::DeviationNotFound(_))));
    }

    #[tokio::test]
    async fn test_revert_after_failure_guarded_by_lease() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(0)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let reverted = repo
            .revert_after_failure("dev1", "old-lease", DeviationStatus::Draft, "Publishing failed")
            .await
            .unwrap();
        assert!(!reverted);
    }

    #[tokio::test]
    async fn test_clear_stale_locks() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([exec(3)])
                .into_connection(),
        );

        let repo = DeviationRepository::new(db);
        let cleared = repo.clear_stale_locks(Utc::now()).await.unwrap();
        assert_eq!(cleared, 3);
    }
}
