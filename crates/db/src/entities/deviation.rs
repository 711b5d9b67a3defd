//! Deviation entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Publication status of a deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum DeviationStatus {
    /// Editable, not queued.
    #[sea_orm(string_value = "draft")]
    Draft,
    /// Waiting for (or retrying) publication.
    #[sea_orm(string_value = "scheduled")]
    Scheduled,
    /// Live on the external platform.
    #[sea_orm(string_value = "published")]
    Published,
}

/// How the files of a deviation map onto external posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// All files in one post.
    #[sea_orm(string_value = "single")]
    Single,
    /// Each file is its own post.
    #[sea_orm(string_value = "multiple")]
    Multiple,
}

/// A unit of content with one or more files, published at most once.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "deviation")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Owning user ID
    #[sea_orm(indexed)]
    pub user_id: String,

    /// Title shown on the platform
    pub title: String,

    /// Description body
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    /// Tag list, as a JSON array of strings
    #[sea_orm(column_type = "JsonBinary")]
    pub tags: Json,

    /// Lifecycle status
    pub status: DeviationStatus,

    /// How multiple files are published
    pub upload_mode: UploadMode,

    /// Submit to stash without finalizing
    #[sea_orm(default_value = false)]
    pub stash_only: bool,

    /// Automation that scheduled this deviation, if any
    #[sea_orm(nullable, indexed)]
    pub automation_id: Option<String>,

    /// When the deviation becomes due
    #[sea_orm(nullable, indexed)]
    pub scheduled_at: Option<DateTimeWithTimeZone>,

    /// External deviation ID, set on publish
    #[sea_orm(nullable)]
    pub deviation_id: Option<String>,

    /// External deviation URL, set on publish
    #[sea_orm(nullable)]
    pub deviation_url: Option<String>,

    /// External stash item ID, set on submit
    #[sea_orm(nullable)]
    pub stash_item_id: Option<String>,

    /// Every item returned by the publish call that succeeded
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub published_items: Option<Json>,

    /// Set on publish
    #[sea_orm(nullable)]
    pub published_at: Option<DateTimeWithTimeZone>,

    /// Human-readable message from the last failed attempt
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    /// Attempts that failed so far
    #[sea_orm(default_value = 0)]
    pub retry_count: i32,

    /// Start of the most recent attempt
    #[sea_orm(nullable)]
    pub last_retry_at: Option<DateTimeWithTimeZone>,

    /// Set once when the owner's post counter has been bumped
    #[sea_orm(default_value = false)]
    pub post_count_incremented: bool,

    /// Lease token of the worker currently publishing
    #[sea_orm(nullable)]
    pub execution_lock_id: Option<String>,

    /// When the current lease was taken
    #[sea_orm(nullable)]
    pub execution_locked_at: Option<DateTimeWithTimeZone>,

    /// Creation timestamp
    pub created_at: DateTimeWithTimeZone,

    /// Last update timestamp
    #[sea_orm(nullable)]
    pub updated_at: Option<DateTimeWithTimeZone>,
}

/// Relations of the deviation table.
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

    /// Automation that scheduled the deviation
    #[sea_orm(
        belongs_to = "super::automation::Entity",
        from = "Column::AutomationId",
        to = "super::automation::Column::Id",
        on_delete = "SetNull"
    )]
    Automation,

    /// Attached files
    #[sea_orm(has_many = "super::deviation_file::Entity")]
    DeviationFile,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::automation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Automation.def()
    }
}

impl Related<super::deviation_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeviationFile.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
