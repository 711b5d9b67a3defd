//! Error types for the deviation publisher.

use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    // === Lookup Errors ===
    /// A generic resource is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No deviation with this ID.
    #[error("Deviation not found: {0}")]
    DeviationNotFound(String),

    /// No user with this ID.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The write conflicts with the current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    // === Infrastructure Errors ===
    /// Database query or connection failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Redis command or connection failure.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Job queue failure.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The external platform returned an error.
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::DeviationNotFound(_) => "DEVIATION_NOT_FOUND",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the error comes from missing data rather than a
    /// failing dependency. Retrying such an error cannot help.
    #[must_use]
    pub const fn is_missing_data(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::DeviationNotFound(_) | Self::UserNotFound(_)
        )
    }
}

// === From implementations ===

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
