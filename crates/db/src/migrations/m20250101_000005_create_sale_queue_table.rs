//! Create `sale_queue` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SaleQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SaleQueue::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SaleQueue::UserId).string_len(32).not_null())
                    .col(
                        ColumnDef::new(SaleQueue::DeviationId)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(SaleQueue::PriceCents).integer().not_null())
                    .col(
                        ColumnDef::new(SaleQueue::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SaleQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sale_queue_deviation")
                            .from(SaleQueue::Table, SaleQueue::DeviationId)
                            .to(Deviation::Table, Deviation::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // A retried commit must not list the same deviation twice
        manager
            .create_index(
                Index::create()
                    .name("idx_sale_queue_deviation_id")
                    .table(SaleQueue::Table)
                    .col(SaleQueue::DeviationId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SaleQueue::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum SaleQueue {
    Table,
    Id,
    UserId,
    DeviationId,
    PriceCents,
    Status,
    CreatedAt,
}

#[derive(Iden)]
enum Deviation {
    Table,
    Id,
}
