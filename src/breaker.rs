//! Per-dependency circuit breakers with half-open probing
//!
//! Each flaky dependency (the vector cache KV, the embedding service, the
//! relational store health probe) gets a named breaker. After
//! `failure_threshold` consecutive failures the breaker opens and calls fail
//! fast with [`BreakerError::Open`] so callers can fall back (e.g. cache →
//! direct store). After `recovery_timeout` the next call is admitted as a
//! half-open probe; success closes the breaker, any failure re-opens it.
//!
//! A process-wide [`BreakerRegistry`] is built once at boot and passed into
//! components; it exposes per-service metrics for observability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// Breaker service name for the L2 cache key-value store.
pub const VECTOR_CACHE_KV: &str = "vector_cache_kv";
/// Breaker service name for the embedding / rerank service.
pub const EMBEDDING_SERVICE: &str = "embedding_service";
/// Breaker service name for relational store health probes.
pub const RELATIONAL_DB_HEALTH: &str = "relational_db_health";

/// Error returned when a breaker refuses or observes a call.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker is open; the dependency was not called.
    #[error("circuit breaker '{service}' is open")]
    Open { service: String },
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-service breaker configuration.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe
    pub recovery_timeout: Duration,
    /// Probes admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Snapshot of a breaker's counters, for monitoring surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_opened_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    opened_at: Option<Instant>,
    last_opened_at: Option<chrono::DateTime<chrono::Utc>>,
    half_open_in_flight: u32,
}

/// Fail-fast gate around a single named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for a named dependency.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                opened_at: None,
                last_opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Service name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (open breakers report half-open once the recovery
    /// timeout has elapsed, since the next call would be admitted).
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.recovery_elapsed(&inner) => CircuitState::HalfOpen,
            s => s,
        }
    }

    /// Admit or refuse a call.
    ///
    /// Callers using this low-level API must pair every `Ok(())` with exactly
    /// one [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn check(&self) -> Result<(), BreakerError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.recovery_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    tracing::info!(service = %self.name, "Circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        service: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        service: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(service = %self.name, "Circuit breaker closed after successful probe");
            inner.state = CircuitState::Closed;
            inner.half_open_in_flight = 0;
            inner.opened_at = None;
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(service = %self.name, "Probe failed, circuit breaker re-opened");
                self.open(&mut inner);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                tracing::warn!(
                    service = %self.name,
                    failures = inner.consecutive_failures,
                    "Failure threshold reached, circuit breaker opened"
                );
                self.open(&mut inner);
            }
            _ => {}
        }
    }

    /// Run an async operation through the breaker.
    ///
    /// Open state refuses the call without invoking `op`; otherwise the
    /// operation's outcome is recorded and its error passed through.
    pub async fn call<T, E, F>(&self, op: F) -> Result<Result<T, E>, BreakerError>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.check()?;
        match op.await {
            Ok(v) => {
                self.record_success();
                Ok(Ok(v))
            }
            Err(e) => {
                self.record_failure();
                Ok(Err(e))
            }
        }
    }

    /// Metrics snapshot for this breaker.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        BreakerMetrics {
            service: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            last_opened_at: inner.last_opened_at,
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.last_opened_at = Some(chrono::Utc::now());
        inner.half_open_in_flight = 0;
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned lock only means a panic mid-update; counters stay usable
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Process-wide registry of named circuit breakers.
///
/// Built once at boot from [`crate::config::Config`] and shared by reference;
/// components look breakers up by service name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under its service name, returning the shared handle.
    pub fn register(&mut self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Look up a breaker by service name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    /// Metrics for every registered breaker, keyed by service name.
    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        let mut all: Vec<BreakerMetrics> = self.breakers.values().map(|b| b.metrics()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(threshold: u32, recovery_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            half_open_max_calls: 1,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = CircuitBreaker::new("svc", fast_config(3, 10_000));
        for _ in 0..2 {
            b.check().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);

        b.check().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.check().is_err());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let b = CircuitBreaker::new("svc", fast_config(3, 10_000));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let b = CircuitBreaker::new("svc", fast_config(1, 10));
        b.record_failure();
        assert!(b.check().is_err());

        std::thread::sleep(Duration::from_millis(20));
        // First call after recovery is admitted as the probe
        b.check().unwrap();
        // Second concurrent call is refused (half_open_max_calls = 1)
        assert!(b.check().is_err());

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        b.check().unwrap();
    }

    #[test]
    fn test_half_open_probe_reopens_on_failure() {
        let b = CircuitBreaker::new("svc", fast_config(1, 10));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        b.check().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.check().is_err());
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_open() {
        let b = CircuitBreaker::new("svc", fast_config(1, 60_000));
        let r: Result<Result<(), &str>, _> = b.call(async { Err("boom") }).await;
        assert!(matches!(r, Ok(Err("boom"))));

        // Breaker is now open: operation must not run
        let r: Result<Result<(), &str>, _> = b
            .call(async {
                panic!("must not be invoked");
            })
            .await;
        assert!(matches!(r, Err(BreakerError::Open { .. })));
    }

    #[test]
    fn test_registry_metrics() {
        let mut reg = BreakerRegistry::new();
        let b = reg.register(EMBEDDING_SERVICE, fast_config(1, 10_000));
        b.record_failure();

        let metrics = reg.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].service, EMBEDDING_SERVICE);
        assert_eq!(metrics[0].state, CircuitState::Open);
        assert_eq!(metrics[0].total_failures, 1);
        assert!(metrics[0].last_opened_at.is_some());
    }
}
