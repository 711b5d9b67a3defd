//! Automation repository.

use std::sync::Arc;

use crate::entities::{Automation, automation};
use publisher_common::{AppError, AppResult};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait};

/// Automation repository for database operations.
#[derive(Clone)]
pub struct AutomationRepository {
    db: Arc<DatabaseConnection>,
}

impl AutomationRepository {
    /// Create a new automation repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Find an automation by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<automation::Model>> {
        Automation::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Create a new automation.
    pub async fn create(&self, model: automation::ActiveModel) -> AppResult<automation::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase};

    #[tokio::test]
    async fn test_find_by_id() {
        let automation = automation::Model {
            id: "auto1".to_string(),
            user_id: "user1".to_string(),
            name: "Weekly drops".to_string(),
            auto_add_to_sale_queue: true,
            sale_price_cents: Some(1500),
            created_at: Utc::now().into(),
        };
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[automation]])
                .into_connection(),
        );

        let repo = AutomationRepository::new(db);
        let result = repo.find_by_id("auto1").await.unwrap().unwrap();
        assert!(result.auto_add_to_sale_queue);
        assert_eq!(result.sale_price_cents, Some(1500));
    }
}
