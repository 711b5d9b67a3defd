//! Sale queue repository.

use std::sync::Arc;

use crate::entities::{SaleQueue, sale_queue};
use publisher_common::{AppError, AppResult};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

/// Sale queue repository for database operations.
#[derive(Clone)]
pub struct SaleQueueRepository {
    db: Arc<DatabaseConnection>,
}

impl SaleQueueRepository {
    /// Create a new sale queue repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find the sale queue entry of a deviation.
    pub async fn find_by_deviation(
        &self,
        deviation_id: &str,
    ) -> AppResult<Option<sale_queue::Model>> {
        SaleQueue::find()
            .filter(sale_queue::Column::DeviationId.eq(deviation_id))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entities::sale_queue::SaleQueueStatus;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    #[tokio::test]
    async fn test_find_by_deviation() {
        let entry = sale_queue::Model {
            id: "sale1".to_string(),
            user_id: "user1".to_string(),
            deviation_id: "dev1".to_string(),
            price_cents: 900,
            status: SaleQueueStatus::Pending,
            created_at: Utc::now().into(),
        };
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([vec![entry], vec![]])
                .into_connection(),
        );

        let repo = SaleQueueRepository::new(db);
        let found = repo.find_by_deviation("dev1").await.unwrap();
        assert_eq!(found.unwrap().status, SaleQueueStatus::Pending);

        let missing = repo.find_by_deviation("dev2").await.unwrap();
        assert!(missing.is_none());
    }
}
