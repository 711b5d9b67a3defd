//! Classification of publish failures.
//!
//! Every failure from the external platform is mapped onto a fixed set of
//! categories. Each category carries its own retry policy, so the worker
//! never decides retry behavior from raw status codes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::publisher::PublishFailure;

/// Delay used when a strategy has no backoff entries.
const DEFAULT_BACKOFF_MS: u64 = 60_000;

/// Floor applied by [`add_jitter`].
const MIN_JITTERED_MS: u64 = 1_000;

/// Transport error codes that mean the request never got a proper answer.
const NETWORK_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ESOCKETTIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "ENOTFOUND",
    "EAI_AGAIN",
];

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The platform throttled the caller.
    RateLimit,
    /// A usage quota ran out.
    QuotaExceeded,
    /// Credentials were rejected.
    AuthError,
    /// The access token expired.
    TokenExpired,
    /// The refresh token expired; the owner must sign in again.
    RefreshTokenExpired,
    /// The payload was rejected.
    ValidationError,
    /// Transport failure or timeout.
    NetworkError,
    /// The platform failed with a 5xx.
    ServerError,
    /// Anything else.
    Unknown,
}

/// How a category is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Delay before each retry, in order.
    pub backoff_ms: &'static [u64],
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// The category signals platform-wide throttling.
    pub use_circuit_breaker: bool,
    /// The owner's credentials must be refreshed before the next attempt.
    pub requires_credential_refresh: bool,
}

impl ErrorCategory {
    /// Machine-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "RATE_LIMIT",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::AuthError => "AUTH_ERROR",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::RefreshTokenExpired => "REFRESH_TOKEN_EXPIRED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Retry policy of the category.
    #[must_use]
    pub const fn strategy(self) -> RetryStrategy {
        match self {
            Self::RateLimit => RetryStrategy {
                backoff_ms: &[5_000, 10_000, 20_000, 40_000, 80_000, 160_000, 300_000],
                max_attempts: 7,
                use_circuit_breaker: true,
                requires_credential_refresh: false,
            },
            Self::QuotaExceeded => RetryStrategy {
                backoff_ms: &[300_000, 900_000, 1_800_000],
                max_attempts: 3,
                use_circuit_breaker: true,
                requires_credential_refresh: false,
            },
            Self::AuthError => RetryStrategy {
                backoff_ms: &[2_000, 5_000, 10_000],
                max_attempts: 3,
                use_circuit_breaker: false,
                requires_credential_refresh: false,
            },
            Self::TokenExpired => RetryStrategy {
                backoff_ms: &[1_000, 3_000],
                max_attempts: 2,
                use_circuit_breaker: false,
                requires_credential_refresh: true,
            },
            Self::RefreshTokenExpired | Self::ValidationError => RetryStrategy {
                backoff_ms: &[],
                max_attempts: 0,
                use_circuit_breaker: false,
                requires_credential_refresh: false,
            },
            Self::NetworkError => RetryStrategy {
                backoff_ms: &[2_000, 5_000, 10_000, 30_000, 60_000],
                max_attempts: 5,
                use_circuit_breaker: false,
                requires_credential_refresh: false,
            },
            Self::ServerError => RetryStrategy {
                backoff_ms: &[5_000, 10_000, 30_000, 60_000, 120_000],
                max_attempts: 5,
                use_circuit_breaker: false,
                requires_credential_refresh: false,
            },
            Self::Unknown => RetryStrategy {
                backoff_ms: &[5_000, 15_000, 30_000],
                max_attempts: 3,
                use_circuit_breaker: false,
                requires_credential_refresh: false,
            },
        }
    }

    /// Whether another attempt can succeed without outside help.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::RefreshTokenExpired | Self::ValidationError)
    }

    /// Message stored on the deviation. Raw API bodies never reach users.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::RateLimit => {
                "The platform is rate limiting requests. Publishing will be retried."
            }
            Self::QuotaExceeded => {
                "The daily submission quota was reached. Publishing will be retried later."
            }
            Self::AuthError => "The platform rejected the account credentials.",
            Self::TokenExpired => "The access token expired and needs to be refreshed.",
            Self::RefreshTokenExpired => {
                "The account connection expired. Please reconnect your account."
            }
            Self::ValidationError => {
                "The platform rejected the submission. Please check the title, tags and files."
            }
            Self::NetworkError => "The platform could not be reached.",
            Self::ServerError => "The platform reported an internal error.",
            Self::Unknown => "Publishing failed for an unknown reason.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of the failure that was categorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Error message.
    pub message: String,
    /// HTTP status, if any.
    pub status: Option<u16>,
    /// Error code, if any.
    pub code: Option<String>,
    /// When the error was categorized.
    pub timestamp: DateTime<Utc>,
}

/// A failure together with the policy that applies to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorizedError {
    /// Assigned category.
    pub category: ErrorCategory,
    /// Whether the category is retryable.
    pub is_retryable: bool,
    /// Retry strategy for the category.
    pub strategy: RetryStrategy,
    /// The error being categorized.
    pub context: ErrorContext,
    /// Raw `Retry-After` hint, if the platform sent one.
    pub retry_after: Option<String>,
}

/// Categorize a publish failure.
///
/// Precedence: explicit error code, then HTTP status, then transport code,
/// then message keywords.
#[must_use]
pub fn categorize(failure: &PublishFailure) -> CategorizedError {
    let category = classify(failure);

    CategorizedError {
        category,
        is_retryable: category.is_retryable(),
        strategy: category.strategy(),
        context: ErrorContext {
            message: failure.message.clone(),
            status: failure.status,
            code: failure.code.clone(),
            timestamp: Utc::now(),
        },
        retry_after: failure.retry_after.clone(),
    }
}

fn classify(failure: &PublishFailure) -> ErrorCategory {
    let message = failure.message.to_lowercase();
    let code = failure.code.as_deref().map(str::to_uppercase);

    match code.as_deref() {
        Some("REFRESH_TOKEN_EXPIRED") => return ErrorCategory::RefreshTokenExpired,
        Some("TOKEN_EXPIRED") => return ErrorCategory::TokenExpired,
        Some("RATE_LIMIT") => return ErrorCategory::RateLimit,
        Some("QUOTA_EXCEEDED") => return ErrorCategory::QuotaExceeded,
        _ => {}
    }

    if let Some(status) = failure.status {
        match status {
            429 => return ErrorCategory::RateLimit,
            401 => {
                if mentions_refresh_token(&message) {
                    return ErrorCategory::RefreshTokenExpired;
                }
                if mentions_bad_token(&message) {
                    return ErrorCategory::TokenExpired;
                }
                return ErrorCategory::AuthError;
            }
            403 => return ErrorCategory::AuthError,
            400 => return ErrorCategory::ValidationError,
            500..=599 => return ErrorCategory::ServerError,
            _ => {}
        }
    }

    if code.as_deref().is_some_and(|c| NETWORK_CODES.contains(&c)) {
        return ErrorCategory::NetworkError;
    }

    classify_message(&message)
}

fn mentions_refresh_token(message: &str) -> bool {
    message.contains("refresh token") || message.contains("refresh_token")
}

fn mentions_bad_token(message: &str) -> bool {
    message.contains("token") && (message.contains("expired") || message.contains("invalid"))
}

fn classify_message(message: &str) -> ErrorCategory {
    if message.contains("rate limit")
        || message.contains("rate_limit")
        || message.contains("too many requests")
    {
        ErrorCategory::RateLimit
    } else if message.contains("quota") {
        ErrorCategory::QuotaExceeded
    } else if mentions_refresh_token(message) {
        ErrorCategory::RefreshTokenExpired
    } else if mentions_bad_token(message) {
        ErrorCategory::TokenExpired
    } else if message.contains("timeout")
        || message.contains("timed out")
        || message.contains("connection reset")
        || message.contains("connection refused")
        || message.contains("network")
    {
        ErrorCategory::NetworkError
    } else if message.contains("validation") || message.contains("invalid") {
        ErrorCategory::ValidationError
    } else if message.contains("unauthorized")
        || message.contains("forbidden")
        || message.contains("auth")
    {
        ErrorCategory::AuthError
    } else {
        ErrorCategory::Unknown
    }
}

/// Whether another attempt is allowed after `attempts` attempts.
#[must_use]
pub const fn should_retry(error: &CategorizedError, attempts: u32) -> bool {
    error.is_retryable && attempts < error.strategy.max_attempts
}

/// Backoff before retry number `index` (0-based).
///
/// Past the end of the table the last entry repeats. An empty table
/// yields one minute.
#[must_use]
pub fn backoff_delay(strategy: &RetryStrategy, index: usize) -> Duration {
    let ms = strategy
        .backoff_ms
        .get(index)
        .or_else(|| strategy.backoff_ms.last())
        .copied()
        .unwrap_or(DEFAULT_BACKOFF_MS);
    Duration::from_millis(ms)
}

/// Spread `base_ms` by up to `percent` in either direction, never below one
/// second.
#[must_use]
pub fn add_jitter(base_ms: u64, percent: u32) -> u64 {
    let spread = base_ms.saturating_mul(u64::from(percent.min(100))) / 100;
    let low = base_ms.saturating_sub(spread);
    let high = base_ms.saturating_add(spread);

    let jittered = if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        base_ms
    };

    jittered.max(MIN_JITTERED_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_status() {
        let err = categorize(&PublishFailure::new("slow down").with_status(429));
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.is_retryable);
        assert!(err.strategy.use_circuit_breaker);
        assert_eq!(err.strategy.max_attempts, 7);
    }

    #[test]
    fn test_validation_is_terminal() {
        let err = categorize(&PublishFailure::new("title too long").with_status(400));
        assert_eq!(err.category, ErrorCategory::ValidationError);
        assert!(!err.is_retryable);
        assert!(err.strategy.backoff_ms.is_empty());
        assert!(!should_retry(&err, 0));
    }

    #[test]
    fn test_explicit_code_wins_over_status() {
        let failure = PublishFailure::new("whatever")
            .with_status(500)
            .with_code("REFRESH_TOKEN_EXPIRED");
        let err = categorize(&failure);
        assert_eq!(err.category, ErrorCategory::RefreshTokenExpired);
        assert!(!err.is_retryable);

        let quota = categorize(
            &PublishFailure::new("x")
                .with_status(400)
                .with_code("QUOTA_EXCEEDED"),
        );
        assert_eq!(quota.category, ErrorCategory::QuotaExceeded);
    }

    #[test]
    fn test_unauthorized_variants() {
        let plain = categorize(&PublishFailure::new("Unauthorized").with_status(401));
        assert_eq!(plain.category, ErrorCategory::AuthError);

        let expired = categorize(&PublishFailure::new("Access token expired").with_status(401));
        assert_eq!(expired.category, ErrorCategory::TokenExpired);
        assert!(expired.strategy.requires_credential_refresh);

        let refresh = categorize(&PublishFailure::new("Refresh token revoked").with_status(401));
        assert_eq!(refresh.category, ErrorCategory::RefreshTokenExpired);
    }

    #[test]
    fn test_forbidden_and_server_errors() {
        assert_eq!(
            categorize(&PublishFailure::new("nope").with_status(403)).category,
            ErrorCategory::AuthError
        );
        assert_eq!(
            categorize(&PublishFailure::new("bad gateway").with_status(502)).category,
            ErrorCategory::ServerError
        );
    }

    #[test]
    fn test_network_codes() {
        for code in ["ETIMEDOUT", "ECONNRESET", "econnrefused", "ENOTFOUND"] {
            let err = categorize(&PublishFailure::new("socket error").with_code(code));
            assert_eq!(err.category, ErrorCategory::NetworkError, "code {code}");
        }
    }

    #[test]
    fn test_message_keywords() {
        let cases = [
            ("Rate limit exceeded", ErrorCategory::RateLimit),
            ("Daily QUOTA reached", ErrorCategory::QuotaExceeded),
            ("request timed out", ErrorCategory::NetworkError),
            ("validation failed for tags", ErrorCategory::ValidationError),
            ("auth failure", ErrorCategory::AuthError),
            ("token is invalid", ErrorCategory::TokenExpired),
            ("something odd", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(categorize(&PublishFailure::new(message)).category, expected, "{message}");
        }
    }

    #[test]
    fn test_unhandled_status_falls_through_to_message() {
        let err = categorize(&PublishFailure::new("quota used up").with_status(404));
        assert_eq!(err.category, ErrorCategory::QuotaExceeded);
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let err = categorize(&PublishFailure::new("x").with_status(401));
        assert!(should_retry(&err, 2));
        assert!(!should_retry(&err, 3));
    }

    #[test]
    fn test_backoff_delay() {
        let strategy = ErrorCategory::NetworkError.strategy();
        assert_eq!(backoff_delay(&strategy, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(&strategy, 3), Duration::from_secs(30));
        // Past the end repeats the last entry
        assert_eq!(backoff_delay(&strategy, 42), Duration::from_secs(60));

        let empty = ErrorCategory::ValidationError.strategy();
        assert_eq!(backoff_delay(&empty, 0), Duration::from_secs(60));
    }

    #[test]
    fn test_add_jitter_bounds() {
        for _ in 0..200 {
            let value = add_jitter(10_000, 20);
            assert!((8_000..=12_000).contains(&value));
        }
        assert_eq!(add_jitter(100, 20), 1_000);
        assert_eq!(add_jitter(5_000, 0), 5_000);
    }

    #[test]
    fn test_every_category_has_user_message() {
        let all = [
            ErrorCategory::RateLimit,
            ErrorCategory::QuotaExceeded,
            ErrorCategory::AuthError,
            ErrorCategory::TokenExpired,
            ErrorCategory::RefreshTokenExpired,
            ErrorCategory::ValidationError,
            ErrorCategory::NetworkError,
            ErrorCategory::ServerError,
            ErrorCategory::Unknown,
        ];
        for category in all {
            assert!(!category.user_message().is_empty());
            assert_eq!(category.is_retryable(), category.strategy().max_attempts > 0);
        }
    }
}
