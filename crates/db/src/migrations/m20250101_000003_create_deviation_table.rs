//! Create `deviation` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Deviation::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Deviation::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Deviation::UserId).string_len(32).not_null())
                    .col(ColumnDef::new(Deviation::Title).string_len(256).not_null())
                    .col(ColumnDef::new(Deviation::Description).text())
                    .col(
                        ColumnDef::new(Deviation::Tags)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'[]'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(Deviation::Status)
                            .string_len(16)
                            .not_null()
                            .default("draft"),
                    )
                    .col(
                        ColumnDef::new(Deviation::UploadMode)
                            .string_len(16)
                            .not_null()
                            .default("single"),
                    )
                    .col(
                        ColumnDef::new(Deviation::StashOnly)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Deviation::AutomationId).string_len(32))
                    .col(ColumnDef::new(Deviation::ScheduledAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Deviation::DeviationId).string_len(128))
                    .col(ColumnDef::new(Deviation::DeviationUrl).string_len(512))
                    .col(ColumnDef::new(Deviation::StashItemId).string_len(128))
                    .col(ColumnDef::new(Deviation::PublishedItems).json_binary())
                    .col(ColumnDef::new(Deviation::PublishedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Deviation::ErrorMessage).text())
                    .col(
                        ColumnDef::new(Deviation::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Deviation::LastRetryAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Deviation::PostCountIncremented)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Deviation::ExecutionLockId).string_len(64))
                    .col(ColumnDef::new(Deviation::ExecutionLockedAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Deviation::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Deviation::UpdatedAt).timestamp_with_time_zone())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_deviation_user")
                            .from(Deviation::Table, Deviation::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_deviation_automation")
                            .from(Deviation::Table, Deviation::AutomationId)
                            .to(Automation::Table, Automation::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_deviation_user_id")
                    .table(Deviation::Table)
                    .col(Deviation::UserId)
                    .to_owned(),
            )
            .await?;

        // Dispatcher scans scheduled rows by due time
        manager
            .create_index(
                Index::create()
                    .name("idx_deviation_status_scheduled_at")
                    .table(Deviation::Table)
                    .col(Deviation::Status)
                    .col(Deviation::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Deviation::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Deviation {
    Table,
    Id,
    UserId,
    Title,
    Description,
    Tags,
    Status,
    UploadMode,
    StashOnly,
    AutomationId,
    ScheduledAt,
    DeviationId,
    DeviationUrl,
    StashItemId,
    PublishedItems,
    PublishedAt,
    ErrorMessage,
    RetryCount,
    LastRetryAt,
    PostCountIncremented,
    ExecutionLockId,
    ExecutionLockedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum User {
    Table,
    Id,
}

#[derive(Iden)]
enum Automation {
    Table,
    Id,
}
