//! Create `deviation_file` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeviationFile::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviationFile::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DeviationFile::DeviationId)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviationFile::StorageKey)
                            .string_len(512)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviationFile::OriginalFilename)
                            .string_len(256)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviationFile::MimeType)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeviationFile::FileSize).big_integer().not_null())
                    .col(
                        ColumnDef::new(DeviationFile::SortOrder)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DeviationFile::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_deviation_file_deviation")
                            .from(DeviationFile::Table, DeviationFile::DeviationId)
                            .to(Deviation::Table, Deviation::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_deviation_file_deviation_id")
                    .table(DeviationFile::Table)
                    .col(DeviationFile::DeviationId)
                    .col(DeviationFile::SortOrder)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviationFile::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DeviationFile {
    Table,
    Id,
    DeviationId,
    StorageKey,
    OriginalFilename,
    MimeType,
    FileSize,
    SortOrder,
    CreatedAt,
}

#[derive(Iden)]
enum Deviation {
    Table,
    Id,
}
