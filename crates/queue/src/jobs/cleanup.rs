//! Storage cleanup job.

use serde::{Deserialize, Serialize};

/// Job to remove the uploaded source files of a published deviation.
///
/// Consumed by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCleanupJob {
    /// Published deviation.
    pub deviation_id: String,
    /// Owner of the files.
    pub user_id: String,
    /// Storage keys of the files to delete.
    pub storage_keys: Vec<String>,
}

impl StorageCleanupJob {
    /// Create a new cleanup job.
    #[must_use]
    pub const fn new(deviation_id: String, user_id: String, storage_keys: Vec<String>) -> Self {
        Self {
            deviation_id,
            user_id,
            storage_keys,
        }
    }
}
