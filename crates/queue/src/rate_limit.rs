//! Adaptive per-user rate limiting for calls to the publishing platform.
//!
//! Each subject (a user) has a minimum spacing between publish calls. The
//! spacing grows on every failure and shrinks after a run of successes.
//! Admission is a single atomic check-and-touch in the shared store, so
//! concurrent workers never both pass the same window.
//!
//! The limiter fails open: when the store is unreachable requests are
//! allowed and feedback is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use publisher_common::RateLimitSettings;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::error_category::add_jitter;

/// Persisted limiter state for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Current spacing between requests.
    pub base_delay_ms: u64,
    /// Unix millis of the last admitted request.
    pub last_request_ms: Option<i64>,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Unix millis before which no request may be made.
    pub retry_after_ms: Option<i64>,
}

impl RateLimitState {
    fn fresh(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            last_request_ms: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            retry_after_ms: None,
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    /// The platform asked us to back off until a deadline.
    RetryAfter,
    /// Not enough time has passed since the previous request.
    MinDelay,
}

impl DenyReason {
    /// Machine-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RetryAfter => "RETRY_AFTER",
            Self::MinDelay => "MIN_DELAY",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may go ahead.
    pub allowed: bool,
    /// Why it was denied.
    pub reason: Option<DenyReason>,
    /// How long to wait before trying again.
    pub wait: Option<Duration>,
}

impl RateLimitDecision {
    const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            wait: None,
        }
    }

    const fn deny(reason: DenyReason, wait_ms: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            wait: Some(Duration::from_millis(wait_ms)),
        }
    }
}

/// Result of the atomic admission step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The request may proceed; `last_request_ms` was updated.
    Acquired,
    /// Too early; retry after this many milliseconds.
    Wait(u64),
}

/// Storage for limiter state.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Load the state of a subject.
    async fn load(&self, subject: &str) -> Result<Option<RateLimitState>, StoreError>;

    /// Persist delay, counters and retry deadline. Never touches
    /// `last_request_ms`.
    async fn save_feedback(&self, subject: &str, state: &RateLimitState) -> Result<(), StoreError>;

    /// Compare the time since the last request with the stored delay (or
    /// `default_delay_ms` when none is stored) and, if enough time has
    /// passed, record `now_ms` as the last request. Must be atomic.
    async fn try_acquire_slot(
        &self,
        subject: &str,
        now_ms: i64,
        default_delay_ms: u64,
    ) -> Result<SlotOutcome, StoreError>;

    /// Forget a subject.
    async fn clear(&self, subject: &str) -> Result<(), StoreError>;
}

/// In-process limiter store.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    states: RwLock<HashMap<String, RateLimitState>>,
}

impl MemoryRateLimitStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn load(&self, subject: &str) -> Result<Option<RateLimitState>, StoreError> {
        Ok(self.states.read().await.get(subject).cloned())
    }

    async fn save_feedback(&self, subject: &str, state: &RateLimitState) -> Result<(), StoreError> {
        let mut states = self.states.write().await;
        let entry = states
            .entry(subject.to_string())
            .or_insert_with(|| RateLimitState::fresh(state.base_delay_ms));
        entry.base_delay_ms = state.base_delay_ms;
        entry.consecutive_successes = state.consecutive_successes;
        entry.consecutive_failures = state.consecutive_failures;
        entry.retry_after_ms = state.retry_after_ms;
        Ok(())
    }

    async fn try_acquire_slot(
        &self,
        subject: &str,
        now_ms: i64,
        default_delay_ms: u64,
    ) -> Result<SlotOutcome, StoreError> {
        let mut states = self.states.write().await;
        let entry = states
            .entry(subject.to_string())
            .or_insert_with(|| RateLimitState::fresh(default_delay_ms));

        if let Some(last) = entry.last_request_ms {
            let elapsed = now_ms.saturating_sub(last).max(0) as u64;
            if elapsed < entry.base_delay_ms {
                return Ok(SlotOutcome::Wait(entry.base_delay_ms - elapsed));
            }
        }

        entry.last_request_ms = Some(now_ms);
        Ok(SlotOutcome::Acquired)
    }

    async fn clear(&self, subject: &str) -> Result<(), StoreError> {
        self.states.write().await.remove(subject);
        Ok(())
    }
}

/// Adaptive rate limiter.
#[derive(Clone)]
pub struct AdaptiveRateLimiter {
    store: Arc<dyn RateLimitStore>,
    settings: RateLimitSettings,
}

impl AdaptiveRateLimiter {
    /// Create a limiter over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    /// Decide whether `subject` may make a request now.
    pub async fn should_allow(&self, subject: &str) -> RateLimitDecision {
        if !self.settings.enabled {
            return RateLimitDecision::allow();
        }

        let now_ms = Utc::now().timestamp_millis();

        match self.store.load(subject).await {
            Ok(Some(RateLimitState {
                retry_after_ms: Some(deadline),
                ..
            })) if deadline > now_ms => {
                let wait_ms = (deadline - now_ms) as u64;
                debug!(subject = %subject, wait_ms, "Denied by retry-after deadline");
                return RateLimitDecision::deny(DenyReason::RetryAfter, wait_ms);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(subject = %subject, error = %e, "Rate limit store unavailable, allowing");
                return RateLimitDecision::allow();
            }
        }

        match self
            .store
            .try_acquire_slot(subject, now_ms, self.settings.base_delay_ms)
            .await
        {
            Ok(SlotOutcome::Acquired) => RateLimitDecision::allow(),
            Ok(SlotOutcome::Wait(wait_ms)) => {
                debug!(subject = %subject, wait_ms, "Denied by minimum delay");
                RateLimitDecision::deny(DenyReason::MinDelay, wait_ms)
            }
            Err(e) => {
                warn!(subject = %subject, error = %e, "Rate limit store unavailable, allowing");
                RateLimitDecision::allow()
            }
        }
    }

    /// Record a successful request.
    pub async fn record_success(&self, subject: &str) {
        let Some(mut state) = self.load_or_fresh(subject).await else {
            return;
        };

        state.consecutive_successes += 1;
        state.consecutive_failures = 0;

        if state.consecutive_successes >= self.settings.success_threshold {
            let decreased =
                (state.base_delay_ms as f64 * self.settings.success_decrease_factor) as u64;
            let floored = decreased.max(self.settings.min_delay_ms);
            if floored != state.base_delay_ms {
                debug!(
                    subject = %subject,
                    from = state.base_delay_ms,
                    to = floored,
                    "Decreasing delay"
                );
            }
            state.base_delay_ms = floored;
            state.consecutive_successes = 0;
        }

        self.save(subject, &state).await;
    }

    /// Record a failed request, with the platform's `Retry-After` header if
    /// it sent one.
    pub async fn record_failure(&self, subject: &str, retry_after: Option<&str>) {
        let Some(mut state) = self.load_or_fresh(subject).await else {
            return;
        };

        state.consecutive_failures += 1;
        state.consecutive_successes = 0;

        let increased = (state.base_delay_ms as f64 * self.settings.failure_increase_factor) as u64;
        state.base_delay_ms = increased.min(self.settings.max_delay_ms);

        if let Some(header) = retry_after {
            let seconds = parse_retry_after(header);
            if seconds > 0 {
                let deadline = Utc::now().timestamp_millis() + (seconds as i64) * 1000;
                state.retry_after_ms = Some(deadline);
            }
        }

        info!(
            subject = %subject,
            base_delay_ms = state.base_delay_ms,
            consecutive_failures = state.consecutive_failures,
            "Increased publish delay after failure"
        );

        self.save(subject, &state).await;
    }

    /// Current delay for `subject` with jitter applied, at least one second.
    pub async fn wait_time(&self, subject: &str) -> Duration {
        let base = match self.store.load(subject).await {
            Ok(Some(state)) => state.base_delay_ms,
            Ok(None) => self.settings.base_delay_ms,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Rate limit store unavailable");
                self.settings.base_delay_ms
            }
        };
        Duration::from_millis(add_jitter(base, self.settings.jitter_percent))
    }

    /// Stored state of `subject`, if any.
    pub async fn state(&self, subject: &str) -> Option<RateLimitState> {
        match self.store.load(subject).await {
            Ok(state) => state,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Rate limit store unavailable");
                None
            }
        }
    }

    /// Drop all state for `subject`.
    pub async fn reset(&self, subject: &str) {
        if let Err(e) = self.store.clear(subject).await {
            warn!(subject = %subject, error = %e, "Failed to reset rate limit state");
        }
    }

    async fn load_or_fresh(&self, subject: &str) -> Option<RateLimitState> {
        match self.store.load(subject).await {
            Ok(state) => Some(
                state.unwrap_or_else(|| RateLimitState::fresh(self.settings.base_delay_ms)),
            ),
            Err(e) => {
                warn!(subject = %subject, error = %e, "Rate limit store unavailable");
                None
            }
        }
    }

    async fn save(&self, subject: &str, state: &RateLimitState) {
        if let Err(e) = self.store.save_feedback(subject, state).await {
            warn!(subject = %subject, error = %e, "Failed to save rate limit state");
        }
    }
}

/// Parse a `Retry-After` header into seconds from now.
///
/// Accepts integer seconds or an HTTP date. Anything unparsable,
/// non-positive or in the past yields 0.
#[must_use]
pub fn parse_retry_after(header: &str) -> u64 {
    let value = header.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return seconds.max(0) as u64;
    }

    parse_http_date(value).map_or(0, |date| {
        let seconds = date.signed_duration_since(Utc::now()).num_seconds();
        seconds.max(0) as u64
    })
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }

    // IMF-fixdate with a literal GMT and the obsolete RFC 850 / asctime forms
    let formats = [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            enabled: true,
            base_delay_ms: 3_000,
            min_delay_ms: 1_000,
            max_delay_ms: 10_000,
            success_threshold: 3,
            success_decrease_factor: 0.5,
            failure_increase_factor: 2.0,
            jitter_percent: 20,
            state_ttl_secs: 3_600,
        }
    }

    fn limiter() -> (AdaptiveRateLimiter, Arc<MemoryRateLimitStore>) {
        let store = Arc::new(MemoryRateLimitStore::new());
        (AdaptiveRateLimiter::new(store.clone(), settings()), store)
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn load(&self, _: &str) -> Result<Option<RateLimitState>, StoreError> {
            Err(StoreError::Redis("connection refused".to_string()))
        }
        async fn save_feedback(&self, _: &str, _: &RateLimitState) -> Result<(), StoreError> {
            Err(StoreError::Redis("connection refused".to_string()))
        }
        async fn try_acquire_slot(
            &self,
            _: &str,
            _: i64,
            _: u64,
        ) -> Result<SlotOutcome, StoreError> {
            Err(StoreError::Redis("connection refused".to_string()))
        }
        async fn clear(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Redis("connection refused".to_string()))
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), 120);
        assert_eq!(parse_retry_after(" 5 "), 5);
        assert_eq!(parse_retry_after("0"), 0);
        assert_eq!(parse_retry_after("-10"), 0);
        assert_eq!(parse_retry_after("soon"), 0);
        assert_eq!(parse_retry_after(""), 0);
    }

    #[test]
    fn test_parse_retry_after_dates() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), 0);

        let future = (Utc::now() + chrono::Duration::seconds(90))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let seconds = parse_retry_after(&future);
        assert!((85..=90).contains(&seconds), "got {seconds}");
    }

    #[tokio::test]
    async fn test_first_request_allowed_second_waits() {
        let (limiter, _) = limiter();

        assert!(limiter.should_allow("u1").await.allowed);

        let denied = limiter.should_allow("u1").await;
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::MinDelay));
        let wait = denied.wait.unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(3_000));

        // Other subjects are independent
        assert!(limiter.should_allow("u2").await.allowed);
    }

    #[tokio::test]
    async fn test_disabled_always_allows() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let limiter = AdaptiveRateLimiter::new(
            store,
            RateLimitSettings {
                enabled: false,
                ..settings()
            },
        );
        assert!(limiter.should_allow("u1").await.allowed);
        assert!(limiter.should_allow("u1").await.allowed);
    }

    #[tokio::test]
    async fn test_failure_doubles_delay_up_to_max() {
        let (limiter, _) = limiter();

        limiter.record_failure("u1", None).await;
        assert_eq!(limiter.state("u1").await.unwrap().base_delay_ms, 6_000);

        limiter.record_failure("u1", None).await;
        limiter.record_failure("u1", None).await;
        let state = limiter.state("u1").await.unwrap();
        assert_eq!(state.base_delay_ms, 10_000);
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.consecutive_successes, 0);
    }

    #[tokio::test]
    async fn test_successes_decrease_delay_to_min() {
        let (limiter, _) = limiter();

        for _ in 0..3 {
            limiter.record_success("u1").await;
        }
        let state = limiter.state("u1").await.unwrap();
        assert_eq!(state.base_delay_ms, 1_500);
        assert_eq!(state.consecutive_successes, 0);

        for _ in 0..6 {
            limiter.record_success("u1").await;
        }
        assert_eq!(limiter.state("u1").await.unwrap().base_delay_ms, 1_000);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let (limiter, _) = limiter();

        limiter.record_failure("u1", None).await;
        limiter.record_success("u1").await;
        let state = limiter.state("u1").await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.consecutive_successes, 1);
    }

    #[tokio::test]
    async fn test_retry_after_header_blocks_admission() {
        let (limiter, _) = limiter();

        limiter.record_failure("u1", Some("120")).await;
        let decision = limiter.should_allow("u1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::RetryAfter));
        assert!(decision.wait.unwrap() > Duration::from_secs(110));
    }

    #[tokio::test]
    async fn test_feedback_keeps_last_request_time() {
        let (limiter, store) = limiter();

        assert!(limiter.should_allow("u1").await.allowed);
        let before = store.load("u1").await.unwrap().unwrap().last_request_ms;

        limiter.record_success("u1").await;
        let after = store.load("u1").await.unwrap().unwrap().last_request_ms;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_down() {
        let limiter = AdaptiveRateLimiter::new(Arc::new(BrokenStore), settings());

        assert!(limiter.should_allow("u1").await.allowed);
        limiter.record_failure("u1", Some("60")).await;
        limiter.record_success("u1").await;
        assert!(limiter.state("u1").await.is_none());
        assert!(limiter.wait_time("u1").await >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_time_has_jitter_bounds() {
        let (limiter, _) = limiter();
        for _ in 0..50 {
            let wait = limiter.wait_time("u1").await.as_millis();
            assert!((2_400..=3_600).contains(&wait));
        }
    }

    #[tokio::test]
    async fn test_reset() {
        let (limiter, _) = limiter();
        limiter.record_failure("u1", None).await;
        limiter.reset("u1").await;
        assert!(limiter.state("u1").await.is_none());
        assert!(limiter.should_allow("u1").await.allowed);
    }
}
