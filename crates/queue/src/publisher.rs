//! External publishing seam.
//!
//! The wire format of the creative platform's API lives behind
//! [`DeviationPublisher`]. Implementations resolve the owner's credentials,
//! upload the files and report either one published item or one per file.

use async_trait::async_trait;
use publisher_db::entities::deviation::UploadMode;
use publisher_db::repositories::PublishedItem;
use serde::{Deserialize, Serialize};

use crate::store::PublishCandidate;

/// How the files of a deviation are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// All files in one post.
    Single,
    /// One post per file.
    Multiple,
    /// Submit to stash without finalizing.
    Stash,
}

/// A file to upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFile {
    /// File row ID.
    pub id: String,
    /// Object key in file storage.
    pub storage_key: String,
    /// Filename as uploaded.
    pub original_filename: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub file_size: i64,
}

/// Everything the external publisher needs for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Deviation being published.
    pub deviation_id: String,
    /// Owner whose credentials are used.
    pub user_id: String,
    /// Title shown on the platform.
    pub title: String,
    /// Description body.
    pub description: Option<String>,
    /// Tags, in order.
    pub tags: Vec<String>,
    /// Files in sort order.
    pub files: Vec<PublishFile>,
    /// How the files are published.
    pub mode: PublishMode,
}

impl PublishRequest {
    /// Build a request from a freshly loaded candidate.
    #[must_use]
    pub fn from_candidate(candidate: &PublishCandidate) -> Self {
        let deviation = &candidate.deviation;

        let mode = if deviation.stash_only {
            PublishMode::Stash
        } else {
            match deviation.upload_mode {
                UploadMode::Single => PublishMode::Single,
                UploadMode::Multiple => PublishMode::Multiple,
            }
        };

        let tags = deviation
            .tags
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            deviation_id: deviation.id.clone(),
            user_id: deviation.user_id.clone(),
            title: deviation.title.clone(),
            description: deviation.description.clone(),
            tags,
            files: candidate
                .files
                .iter()
                .map(|f| PublishFile {
                    id: f.id.clone(),
                    storage_key: f.storage_key.clone(),
                    original_filename: f.original_filename.clone(),
                    mime_type: f.mime_type.clone(),
                    file_size: f.file_size,
                })
                .collect(),
            mode,
        }
    }

    /// Override the mode derived from the record, if one was requested.
    #[must_use]
    pub fn with_mode(mut self, mode: Option<PublishMode>) -> Self {
        if let Some(mode) = mode {
            self.mode = mode;
        }
        self
    }
}

/// Result of a successful publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The one item created for all files.
    Single(PublishedItem),
    /// One item per file, in file order.
    Multiple(Vec<PublishedItem>),
}

impl PublishOutcome {
    /// Flatten into the list that gets persisted.
    #[must_use]
    pub fn into_items(self) -> Vec<PublishedItem> {
        match self {
            Self::Single(item) => vec![item],
            Self::Multiple(items) => items,
        }
    }
}

/// A failed call to the external platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PublishFailure {
    /// HTTP status, when the platform answered.
    pub status: Option<u16>,
    /// Machine error code, either the platform's or a transport code such
    /// as `ETIMEDOUT`.
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Raw `Retry-After` header value.
    pub retry_after: Option<String>,
}

impl PublishFailure {
    /// Create a failure with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Failure for a call that did not finish within the job timeout.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new("Publish call timed out").with_code("ETIMEDOUT")
    }

    /// Set the HTTP status.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the raw `Retry-After` value.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: impl Into<String>) -> Self {
        self.retry_after = Some(retry_after.into());
        self
    }
}

/// Client for the external publishing API.
#[async_trait]
pub trait DeviationPublisher: Send + Sync {
    /// Publish the request. Multiple mode returns one item per file.
    async fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, PublishFailure>;
}
