//! Circuit breaker guarding the publishing platform.
//!
//! One breaker per key (user plus external service). State lives in the
//! shared store so every worker sees an open circuit. When the shared store
//! is unreachable a worker falls back to its own in-process state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use publisher_common::CircuitBreakerSettings;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Breaker key for a user's calls to the publishing platform.
#[must_use]
pub fn circuit_key(user_id: &str) -> String {
    format!("user:{user_id}:deviantart")
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow; failures are counted.
    #[default]
    Closed,
    /// Calls are rejected until the open duration elapses.
    Open,
    /// One trial call is in flight.
    HalfOpen,
}

/// Persisted breaker record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Current state.
    pub state: CircuitState,
    /// Failures counted since the last reset.
    pub failures: u32,
    /// Unix millis when the circuit last opened.
    pub opened_at_ms: Option<i64>,
    /// Unix millis when the half-open trial was handed out.
    pub trial_started_ms: Option<i64>,
}

/// Storage for breaker records.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    /// Read the record for `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<CircuitRecord>, StoreError>;
    /// Store the record for `key`.
    async fn save(&self, key: &str, record: &CircuitRecord) -> Result<(), StoreError>;
    /// Forget the record for `key`.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process breaker store.
#[derive(Debug, Default)]
pub struct MemoryCircuitStore {
    records: RwLock<HashMap<String, CircuitRecord>>,
}

impl MemoryCircuitStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<CircuitRecord> {
        self.records.read().await.get(key).cloned()
    }

    /// Replace the record for `key`.
    pub async fn put(&self, key: &str, record: &CircuitRecord) {
        self.records
            .write()
            .await
            .insert(key.to_string(), record.clone());
    }

    /// Drop the record for `key`.
    pub async fn remove(&self, key: &str) {
        self.records.write().await.remove(key);
    }
}

#[async_trait]
impl CircuitStore for MemoryCircuitStore {
    async fn load(&self, key: &str) -> Result<Option<CircuitRecord>, StoreError> {
        Ok(self.get(key).await)
    }

    async fn save(&self, key: &str, record: &CircuitRecord) -> Result<(), StoreError> {
        self.put(key, record).await;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.remove(key).await;
        Ok(())
    }
}

/// Failure-threshold circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStore>,
    local: Arc<MemoryCircuitStore>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreaker {
    /// Create a breaker over the given shared store.
    #[must_use]
    pub fn new(store: Arc<dyn CircuitStore>, settings: CircuitBreakerSettings) -> Self {
        info!(
            failure_threshold = settings.failure_threshold,
            open_duration_secs = settings.open_duration_secs,
            "Circuit breaker initialized"
        );
        Self {
            store,
            local: Arc::new(MemoryCircuitStore::new()),
            settings,
        }
    }

    /// How long an open circuit rejects calls.
    #[must_use]
    pub const fn open_duration(&self) -> Duration {
        Duration::from_secs(self.settings.open_duration_secs)
    }

    /// Whether a call for `key` may go ahead.
    ///
    /// An open circuit whose open duration has elapsed hands out exactly one
    /// trial and moves to half-open. Further checks are denied until the
    /// trial's outcome is recorded, or until another open duration passes
    /// without one.
    pub async fn should_allow(&self, key: &str) -> bool {
        let mut record = self.load(key).await;
        let now_ms = Utc::now().timestamp_millis();
        let open_ms = self.open_duration().as_millis() as i64;

        match record.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened = record.opened_at_ms.unwrap_or(0);
                if now_ms - opened < open_ms {
                    debug!(key = %key, "Circuit open, rejecting call");
                    return false;
                }
                record.state = CircuitState::HalfOpen;
                record.trial_started_ms = Some(now_ms);
                self.save(key, &record).await;
                info!(key = %key, "Circuit half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => {
                let started = record.trial_started_ms.unwrap_or(0);
                if now_ms - started < open_ms {
                    debug!(key = %key, "Trial call in flight, rejecting call");
                    return false;
                }
                // The previous trial never reported back
                record.trial_started_ms = Some(now_ms);
                self.save(key, &record).await;
                warn!(key = %key, "Trial call timed out, allowing another");
                true
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self, key: &str) {
        let record = self.load(key).await;
        if record.state == CircuitState::Closed && record.failures == 0 {
            return;
        }
        if record.state != CircuitState::Closed {
            info!(key = %key, "Circuit closed");
        }
        self.save(key, &CircuitRecord::default()).await;
    }

    /// Record a failed call.
    pub async fn record_failure(&self, key: &str) {
        let mut record = self.load(key).await;
        let now_ms = Utc::now().timestamp_millis();

        match record.state {
            CircuitState::Closed => {
                record.failures += 1;
                if record.failures >= self.settings.failure_threshold {
                    record.state = CircuitState::Open;
                    record.opened_at_ms = Some(now_ms);
                    warn!(key = %key, failures = record.failures, "Circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                record.failures += 1;
                record.state = CircuitState::Open;
                record.opened_at_ms = Some(now_ms);
                record.trial_started_ms = None;
                warn!(key = %key, "Trial call failed, circuit re-opened");
            }
            CircuitState::Open => {
                record.failures += 1;
            }
        }

        self.save(key, &record).await;
    }

    /// Run `operation` if the circuit allows it, otherwise `fallback`.
    ///
    /// Every error of the operation counts as a failure.
    pub async fn wrap<T, E, Op, OpFut, Fb, FbFut>(
        &self,
        key: &str,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, E>
    where
        Op: FnOnce() -> OpFut,
        OpFut: Future<Output = Result<T, E>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        if !self.should_allow(key).await {
            return fallback().await;
        }
        self.execute(key, operation, |_| true).await
    }

    /// Run an already admitted `operation` and record its outcome.
    ///
    /// Errors for which `counts` returns `false` leave the breaker as it is.
    /// An error is never recorded as a success.
    pub async fn execute<T, E, Op, OpFut, Counts>(
        &self,
        key: &str,
        operation: Op,
        counts: Counts,
    ) -> Result<T, E>
    where
        Op: FnOnce() -> OpFut,
        OpFut: Future<Output = Result<T, E>>,
        Counts: FnOnce(&E) -> bool,
    {
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(key).await,
            Err(e) if counts(e) => self.record_failure(key).await,
            Err(_) => debug!(key = %key, "Call failed without counting against the circuit"),
        }
        result
    }

    /// Current state of `key`.
    pub async fn state(&self, key: &str) -> CircuitState {
        self.load(key).await.state
    }

    /// Force `key` back to closed.
    pub async fn reset(&self, key: &str) {
        if let Err(e) = self.store.clear(key).await {
            warn!(key = %key, error = %e, "Failed to reset shared circuit state");
        }
        self.local.remove(key).await;
    }

    async fn load(&self, key: &str) -> CircuitRecord {
        match self.store.load(key).await {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!(key = %key, error = %e, "Circuit store unavailable, using local state");
                self.local.get(key).await.unwrap_or_default()
            }
        }
    }

    async fn save(&self, key: &str, record: &CircuitRecord) {
        if let Err(e) = self.store.save(key, record).await {
            warn!(key = %key, error = %e, "Circuit store unavailable, saving local state");
            self.local.put(key, record).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(MemoryCircuitStore::new()),
            CircuitBreakerSettings {
                failure_threshold: threshold,
                open_duration_secs: open_secs,
            },
        )
    }

    struct BrokenStore;

    #[async_trait]
    impl CircuitStore for BrokenStore {
        async fn load(&self, _: &str) -> Result<Option<CircuitRecord>, StoreError> {
            Err(StoreError::Redis("down".to_string()))
        }
        async fn save(&self, _: &str, _: &CircuitRecord) -> Result<(), StoreError> {
            Err(StoreError::Redis("down".to_string()))
        }
        async fn clear(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Redis("down".to_string()))
        }
    }

    #[test]
    fn test_circuit_key() {
        assert_eq!(circuit_key("u1"), "user:u1:deviantart");
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3, 60);

        for _ in 0..2 {
            breaker.record_failure("k").await;
            assert!(breaker.should_allow("k").await);
        }
        breaker.record_failure("k").await;

        assert_eq!(breaker.state("k").await, CircuitState::Open);
        assert!(!breaker.should_allow("k").await);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(2, 60);

        breaker.record_failure("k").await;
        breaker.record_success("k").await;
        breaker.record_failure("k").await;

        assert_eq!(breaker.state("k").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = breaker(1, 1);

        breaker.record_failure("k").await;
        assert!(!breaker.should_allow("k").await);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(breaker.should_allow("k").await);
        assert_eq!(breaker.state("k").await, CircuitState::HalfOpen);
        assert!(!breaker.should_allow("k").await);

        breaker.record_success("k").await;
        assert_eq!(breaker.state("k").await, CircuitState::Closed);
        assert!(breaker.should_allow("k").await);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1, 1);

        breaker.record_failure("k").await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(breaker.should_allow("k").await);

        breaker.record_failure("k").await;
        assert_eq!(breaker.state("k").await, CircuitState::Open);
        assert!(!breaker.should_allow("k").await);
    }

    #[tokio::test]
    async fn test_wrap_uses_fallback_when_open() {
        let breaker = breaker(1, 60);

        let first: Result<u32, String> = breaker
            .wrap("k", || async { Err("boom".to_string()) }, || async { Ok(0) })
            .await;
        assert!(first.is_err());

        let second: Result<u32, String> = breaker
            .wrap("k", || async { Ok(1) }, || async { Ok(99) })
            .await;
        assert_eq!(second.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_execute_leaves_state_for_uncounted_errors() {
        let breaker = breaker(2, 60);
        breaker.record_failure("k").await;

        let result: Result<(), &str> = breaker
            .execute("k", || async { Err("validation") }, |_| false)
            .await;
        assert!(result.is_err());

        // The earlier failure is still counted
        breaker.record_failure("k").await;
        assert_eq!(breaker.state("k").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_execute_never_closes_on_error() {
        let breaker = breaker(1, 1);
        breaker.record_failure("k").await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(breaker.should_allow("k").await);

        let result: Result<(), &str> = breaker
            .execute("k", || async { Err("validation") }, |_| false)
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state("k").await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let breaker = breaker(1, 60);
        breaker.record_failure("a").await;
        assert!(!breaker.should_allow("a").await);
        assert!(breaker.should_allow("b").await);
    }

    #[tokio::test]
    async fn test_falls_back_to_local_state() {
        let breaker = CircuitBreaker::new(
            Arc::new(BrokenStore),
            CircuitBreakerSettings {
                failure_threshold: 1,
                open_duration_secs: 60,
            },
        );

        assert!(breaker.should_allow("k").await);
        breaker.record_failure("k").await;
        assert!(!breaker.should_allow("k").await);

        breaker.reset("k").await;
        assert!(breaker.should_allow("k").await);
    }
}
