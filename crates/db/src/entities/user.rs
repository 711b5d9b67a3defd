//! User entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A user whose deviations are published on their behalf.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Username on the external platform
    #[sea_orm(unique)]
    pub username: String,

    /// Number of deviations published through the scheduler
    #[sea_orm(default_value = 0)]
    pub post_count: i32,

    /// Creation timestamp
    pub created_at: DateTimeWithTimeZone,

    /// Last update timestamp
    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeWithTimeZone>,
}

/// Relations of the user table.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Deviations owned by the user
    #[sea_orm(has_many = "super::deviation::Entity")]
    Deviation,
}

impl Related<super::deviation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Deviation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
