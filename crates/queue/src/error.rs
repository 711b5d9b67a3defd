//! Error types for the publish pipeline.

use std::sync::Arc;
use std::time::Duration;

use publisher_common::AppError;

use crate::error_category::CategorizedError;
use crate::rate_limit::DenyReason;

/// Shared key-value store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Redis command failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Stored state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Why a publish job did not complete.
#[derive(Debug, thiserror::Error)]
pub enum PublishJobError {
    /// The breaker for the platform refused the call.
    #[error("Circuit breaker is open for {key}")]
    CircuitOpen {
        /// Breaker key.
        key: String,
        /// Time until a trial call is allowed.
        retry_in: Duration,
    },

    /// The limiter refused the call.
    #[error("Rate limited ({reason}) for {subject}, retry in {}ms", .wait.as_millis())]
    RateLimited {
        /// Limiter subject.
        subject: String,
        /// Why the limiter refused.
        reason: DenyReason,
        /// Time until a request is allowed.
        wait: Duration,
    },

    /// The deviation vanished after the lease was taken.
    #[error("Deviation not found: {0}")]
    DeviationNotFound(String),

    /// The owning user no longer exists.
    #[error("Owner of deviation {0} not found")]
    OwnerNotFound(String),

    /// There is nothing to upload.
    #[error("Deviation {0} has no files")]
    NoFiles(String),

    /// The publish call or the commit failed.
    #[error("Publishing failed with {}: {}", .categorized.category, .categorized.context.message)]
    Publish {
        /// The failure and its category.
        categorized: CategorizedError,
        /// No further attempt will be made.
        terminal: bool,
        /// Delay before the next attempt, when one is scheduled.
        retry_in: Option<Duration>,
    },

    /// Database or queue failure.
    #[error(transparent)]
    Store(#[from] AppError),
}

/// Delay before retrying after an infrastructure error.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(30);

impl PublishJobError {
    /// Missing data or a terminal publish failure. Retrying cannot help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::DeviationNotFound(_) | Self::OwnerNotFound(_) | Self::NoFiles(_) => true,
            Self::Publish { terminal, .. } => *terminal,
            Self::CircuitOpen { .. } | Self::RateLimited { .. } | Self::Store(_) => false,
        }
    }

    /// When the job should run again, if at all.
    #[must_use]
    pub const fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            Self::RateLimited { wait, .. } => Some(*wait),
            Self::Publish { retry_in, .. } => *retry_in,
            Self::Store(_) => Some(STORE_RETRY_DELAY),
            Self::DeviationNotFound(_) | Self::OwnerNotFound(_) | Self::NoFiles(_) => None,
        }
    }

    /// Whether the failed run used up one of the job's attempts.
    ///
    /// Gate denials happen before any bookkeeping and do not count.
    #[must_use]
    pub const fn consumes_attempt(&self) -> bool {
        matches!(self, Self::Publish { .. })
    }

    /// Convert into the error reported to the job queue.
    #[must_use]
    pub fn into_worker_error(self) -> apalis::prelude::Error {
        let fatal = self.is_fatal();
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(self);
        if fatal {
            apalis::prelude::Error::Abort(Arc::new(boxed))
        } else {
            apalis::prelude::Error::Failed(Arc::new(boxed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_category::categorize;
    use crate::publisher::PublishFailure;

    #[test]
    fn test_fatal_classification() {
        assert!(PublishJobError::NoFiles("d1".to_string()).is_fatal());
        assert!(
            !PublishJobError::CircuitOpen {
                key: "user:u1:deviantart".to_string(),
                retry_in: Duration::from_secs(60),
            }
            .is_fatal()
        );
        assert!(!PublishJobError::Store(AppError::Database("down".to_string())).is_fatal());
    }

    #[test]
    fn test_terminal_publish_failure_is_fatal() {
        let categorized = categorize(&PublishFailure::new("bad tags").with_status(400));
        let err = PublishJobError::Publish {
            categorized,
            terminal: true,
            retry_in: None,
        };
        assert!(err.is_fatal());
        assert!(err.retry_delay().is_none());
        assert!(err.consumes_attempt());
        assert!(matches!(err.into_worker_error(), apalis::prelude::Error::Abort(_)));
    }

    #[test]
    fn test_gate_denial_keeps_attempt() {
        let err = PublishJobError::RateLimited {
            subject: "u1".to_string(),
            reason: DenyReason::MinDelay,
            wait: Duration::from_millis(1500),
        };
        assert!(!err.consumes_attempt());
        assert_eq!(err.retry_delay(), Some(Duration::from_millis(1500)));
        assert!(err.to_string().contains("MIN_DELAY"));
        assert!(matches!(err.into_worker_error(), apalis::prelude::Error::Failed(_)));
    }
}
