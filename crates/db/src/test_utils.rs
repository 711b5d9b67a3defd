//! Test helpers: throwaway `PostgreSQL` databases and model fixtures.

use std::sync::Arc;

use sea_orm::{ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, Statement};
use tracing::info;

/// Connection settings of the test server.
#[derive(Debug, Clone)]
pub struct TestDbConfig {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Login role.
    pub username: String,
    /// Login password.
    pub password: String,
}

impl Default for TestDbConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("TEST_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("TEST_DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5433),
            username: std::env::var("TEST_DB_USER").unwrap_or_else(|_| "publisher".to_string()),
            password: std::env::var("TEST_DB_PASSWORD")
                .unwrap_or_else(|_| "publisher".to_string()),
        }
    }
}

impl TestDbConfig {
    /// URL of `database` on the test server.
    #[must_use]
    pub fn url(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{database}",
            self.username, self.password, self.host, self.port
        )
    }
}

/// A migrated database that lives for one test.
///
/// Call [`TestDatabase::drop_database`] at the end of the test.
pub struct TestDatabase {
    conn: Arc<DatabaseConnection>,
    name: String,
    config: TestDbConfig,
}

impl TestDatabase {
    /// Create and migrate a database with a unique name.
    pub async fn create() -> Result<Self, DbErr> {
        Self::create_with(TestDbConfig::default()).await
    }

    /// Create and migrate a database on the given server.
    pub async fn create_with(config: TestDbConfig) -> Result<Self, DbErr> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("publisher_test_{}", &suffix[..12]);

        let admin = Database::connect(config.url("postgres")).await?;
        admin
            .execute(Statement::from_string(
                DatabaseBackend::Postgres,
                format!("CREATE DATABASE \"{name}\""),
            ))
            .await?;
        admin.close().await?;

        let conn = Database::connect(config.url(&name)).await?;
        crate::migrate(&conn)
            .await
            .map_err(|e| DbErr::Migration(e.to_string()))?;

        info!(database = %name, "Created test database");

        Ok(Self {
            conn: Arc::new(conn),
            name,
            config,
        })
    }

    /// Shared connection, as the repositories take it.
    #[must_use]
    pub fn conn(&self) -> Arc<DatabaseConnection> {
        self.conn.clone()
    }

    /// Name of the per-test database.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drop the database, disconnecting any pool still open on it.
    pub async fn drop_database(self) -> Result<(), DbErr> {
        drop(self.conn);

        let admin = Database::connect(self.config.url("postgres")).await?;
        // Repositories may still hold clones of the pool
        admin
            .execute(Statement::from_string(
                DatabaseBackend::Postgres,
                format!(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{}'",
                    self.name
                ),
            ))
            .await
            .ok();
        admin
            .execute(Statement::from_string(
                DatabaseBackend::Postgres,
                format!("DROP DATABASE IF EXISTS \"{}\"", self.name),
            ))
            .await?;
        admin.close().await?;

        info!(database = %self.name, "Dropped test database");
        Ok(())
    }
}

/// Models in a publishable starting state.
pub mod fixtures {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::entities::deviation::{DeviationStatus, UploadMode};
    use crate::entities::{automation, deviation, deviation_file, user};

    /// A user with no posts.
    #[must_use]
    pub fn user(id: &str) -> user::Model {
        user::Model {
            id: id.to_string(),
            username: format!("artist_{id}"),
            post_count: 0,
            created_at: Utc::now().into(),
            updated_at: None,
        }
    }

    /// A single-file deviation that became due a minute ago.
    #[must_use]
    pub fn scheduled_deviation(id: &str, user_id: &str) -> deviation::Model {
        deviation::Model {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: "Harbor at dusk".to_string(),
            description: Some("Oil on canvas".to_string()),
            tags: json!(["harbor", "oil"]),
            status: DeviationStatus::Scheduled,
            upload_mode: UploadMode::Single,
            stash_only: false,
            automation_id: None,
            scheduled_at: Some((Utc::now() - Duration::minutes(1)).into()),
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

    /// A PNG file attached to `deviation_id`.
    #[must_use]
    pub fn file(deviation_id: &str, sort_order: i32) -> deviation_file::Model {
        deviation_file::Model {
            id: format!("{deviation_id}-file{sort_order}"),
            deviation_id: deviation_id.to_string(),
            storage_key: format!("uploads/{deviation_id}/{sort_order}.png"),
            original_filename: format!("{sort_order}.png"),
            mime_type: "image/png".to_string(),
            file_size: 1024,
            sort_order,
            created_at: Utc::now().into(),
        }
    }

    /// An automation that lists published deviations for sale.
    #[must_use]
    pub fn sale_automation(
        id: &str,
        user_id: &str,
        sale_price_cents: Option<i32>,
    ) -> automation::Model {
        automation::Model {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: "Weekly harbor".to_string(),
            auto_add_to_sale_queue: true,
            sale_price_cents,
            created_at: Utc::now().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_url() {
        let config = TestDbConfig {
            host: "db".to_string(),
            port: 5433,
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert_eq!(config.url("publisher"), "postgres://user:pass@db:5433/publisher");
    }

    #[test]
    fn test_fixture_deviation_is_due() {
        let dev = fixtures::scheduled_deviation("dev1", "user1");
        assert!(dev.scheduled_at.is_some_and(|at| at < chrono::Utc::now()));
        assert!(dev.execution_lock_id.is_none());
        assert_eq!(fixtures::file("dev1", 2).storage_key, "uploads/dev1/2.png");
    }
}
