//! Create `automation` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Automation::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Automation::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Automation::UserId).string_len(32).not_null())
                    .col(ColumnDef::new(Automation::Name).string_len(256).not_null())
                    .col(
                        ColumnDef::new(Automation::AutoAddToSaleQueue)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Automation::SalePriceCents).integer())
                    .col(
                        ColumnDef::new(Automation::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_automation_user")
                            .from(Automation::Table, Automation::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_automation_user_id")
                    .table(Automation::Table)
                    .col(Automation::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Automation::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Automation {
    Table,
    Id,
    UserId,
    Name,
    AutoAddToSaleQueue,
    SalePriceCents,
    CreatedAt,
}

#[derive(Iden)]
enum User {
    Table,
    Id,
}
