//! Retry ceiling and delay selection for publish jobs.

use std::time::Duration;

use publisher_common::QueueConfig;

use crate::error_category::{CategorizedError, ErrorCategory, add_jitter, backoff_delay};
use crate::rate_limit::parse_retry_after;

/// Jitter applied to category backoff.
const BACKOFF_JITTER_PERCENT: u32 = 20;

/// Retry configuration for publish jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts a job gets before its deviation goes back to draft.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl From<&QueueConfig> for RetryConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryConfig {
    /// Whether `attempt` (1-based) is the last one the queue allows.
    #[must_use]
    pub const fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// Uses the category's backoff table with jitter. A `Retry-After` hint
    /// on a rate limit failure is honored when it asks for longer.
    #[must_use]
    pub fn delay_after(&self, error: &CategorizedError, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let base = backoff_delay(&error.strategy, index);
        let jittered = Duration::from_millis(add_jitter(
            base.as_millis() as u64,
            BACKOFF_JITTER_PERCENT,
        ));

        let hinted = match error.category {
            ErrorCategory::RateLimit | ErrorCategory::QuotaExceeded => error
                .retry_after
                .as_deref()
                .map(|h| Duration::from_secs(parse_retry_after(h))),
            _ => None,
        };

        hinted.map_or(jittered, |hint| hint.max(jittered))
    }
}
