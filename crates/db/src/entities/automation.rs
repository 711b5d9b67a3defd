//! Automation entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A user-defined schedule that creates and queues deviations.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "automation")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Owning user ID
    #[sea_orm(indexed)]
    pub user_id: String,

    /// Display name
    pub name: String,

    /// Add each published deviation to the sale queue
    #[sea_orm(default_value = false)]
    pub auto_add_to_sale_queue: bool,

    /// Price used for sale queue entries, in cents
    #[sea_orm(nullable)]
    pub sale_price_cents: Option<i32>,

    /// Creation timestamp
    pub created_at: DateTimeWithTimeZone,
}

/// Relations of the automation table.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Owning user
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
