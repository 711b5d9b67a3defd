//! Sale queue entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Status of a sale queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum SaleQueueStatus {
    /// Waiting to be listed
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Listing in progress
    #[sea_orm(string_value = "processing")]
    Processing,
    /// Listed for sale
    #[sea_orm(string_value = "completed")]
    Completed,
    /// Listing failed
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// A published deviation waiting to be listed for sale.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sale_queue")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Owning user ID
    #[sea_orm(indexed)]
    pub user_id: String,

    /// One entry per deviation (unique index)
    #[sea_orm(unique)]
    pub deviation_id: String,

    /// Asking price in cents
    pub price_cents: i32,

    /// Listing status
    pub status: SaleQueueStatus,

    /// Creation timestamp
    pub created_at: DateTimeWithTimeZone,
}

/// Relations of the sale queue table.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Deviation to list
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
