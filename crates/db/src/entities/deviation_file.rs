//! Deviation file entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A stored file attached to a deviation.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "deviation_file")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Owning deviation ID
    #[sea_orm(indexed)]
    pub deviation_id: String,

    /// Object key in file storage
    pub storage_key: String,

    /// Filename as uploaded
    pub original_filename: String,

    /// MIME type
    pub mime_type: String,

    /// Size in bytes
    pub file_size: i64,

    /// Position within the deviation, ascending
    #[sea_orm(default_value = 0)]
    pub sort_order: i32,

    /// Creation timestamp
    pub created_at: DateTimeWithTimeZone,
}

/// Relations of the deviation file table.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Owning deviation
    #[sea_orm(
        belongs_to = "super::deviation::Entity",
        from = "Column::DeviationId",
        to = "super::deviation::Column::Id",
        on_delete = "Cascade"
    )]
    Deviation,
}

impl Related<super::deviation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Deviation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
