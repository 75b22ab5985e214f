//! Circuit breaker and breaker registry for backend calls.
//!
//! A [`CircuitBreaker`] tracks consecutive failures for one [`ResourceKey`].
//! When failures reach the configured threshold the circuit *opens* and
//! calls fail fast. Once the reset timeout has elapsed the next call
//! attempt moves the circuit to *half-open*, where a bounded number of
//! trial calls probe recovery.
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │  now - opened_at >= reset_timeout
//!     │ success                          ▼  (checked lazily in allow_call)
//!     └──────────────────────────── HalfOpen
//!                                        │ any failure
//!                                        └────────▶ Open (opened_at = now)
//! ```
//!
//! Every state change is a single critical section under the breaker's own
//! mutex, so concurrent `record_failure` calls from different tasks are
//! never lost. The [`BreakerRegistry`] hands out one shared breaker per key.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ErrorKind};

/// Opaque identifier scoping circuit state, e.g. `"openai:gpt-4o-mini"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, calls allowed.
    Closed,
    /// Tripped, calls rejected until the reset timeout elapses.
    Open,
    /// Probing with a limited number of trial calls allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-backend breaker configuration.
///
/// ```toml
/// [circuit_breaker]
/// failure_threshold = 5
/// reset_timeout_ms = 30000
/// half_open_max_calls = 1
/// excluded_kinds = ["validation_error", "auth_error", "cancelled"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed.
    pub reset_timeout_ms: u64,
    /// Trial calls granted per half-open period.
    pub half_open_max_calls: u32,
    /// Failure kinds that never count toward the threshold.
    pub excluded_kinds: Vec<ErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 1,
            excluded_kinds: vec![
                ErrorKind::ValidationError,
                ErrorKind::AuthError,
                ErrorKind::Cancelled,
            ],
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms: reset_timeout.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_excluded_kinds(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.excluded_kinds = kinds;
        self
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold < 1 {
            return Err(ConfigError::validation(
                "failure_threshold",
                "must be at least 1",
            ));
        }
        if self.half_open_max_calls < 1 {
            return Err(ConfigError::validation(
                "half_open_max_calls",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    fn is_excluded(&self, kind: ErrorKind) -> bool {
        self.excluded_kinds.contains(&kind)
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub key: ResourceKey,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_calls_made: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Failures of an excluded kind, recorded but not counted.
    pub ignored_failures: u64,
    /// Calls refused by `allow_call`.
    pub rejected_calls: u64,
    /// Milliseconds since the circuit last opened, when open.
    pub open_for_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_calls_made: u32,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    ignored_failures: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_calls_made: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            ignored_failures: 0,
            rejected_calls: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_calls_made = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_calls_made = 0;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_calls_made = 0;
    }
}

/// Circuit breaker for a single resource key.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: ResourceKey,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<ResourceKey>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State is plain counters; a panic elsewhere cannot leave it torn.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the next call may proceed.
    ///
    /// Moves Open → HalfOpen once the reset timeout has elapsed, and counts
    /// every trial call granted while half-open.
    pub fn allow_call(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if elapsed >= self.config.reset_timeout() {
                inner.half_open();
                debug!(resource_key = %self.key, "circuit half-open, probing recovery");
            }
        }

        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_calls_made < self.config.half_open_max_calls {
                    inner.half_open_calls_made += 1;
                    true
                } else {
                    false
                }
            }
        };

        if allowed {
            inner.total_calls += 1;
        } else {
            inner.rejected_calls += 1;
        }
        allowed
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.close();
                info!(resource_key = %self.key, "circuit closed after successful trial call");
            }
            // A straggler that started before the circuit opened proves little.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call of the given kind.
    ///
    /// Returns `false` when the kind is excluded and the failure was not
    /// counted toward the threshold.
    pub fn record_failure(&self, kind: ErrorKind) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_failures += 1;

        if self.config.is_excluded(kind) {
            inner.ignored_failures += 1;
            if inner.state == CircuitState::HalfOpen {
                // Release the trial slot; the probe told us nothing.
                inner.half_open_calls_made = inner.half_open_calls_made.saturating_sub(1);
            }
            debug!(resource_key = %self.key, %kind, "failure kind excluded from circuit accounting");
            return false;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open(now);
                    warn!(
                        resource_key = %self.key,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open(now);
                warn!(resource_key = %self.key, %kind, "trial call failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
        true
    }

    /// Current state without evaluating the reset timeout.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Trip the circuit regardless of failure count.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.open(Instant::now());
        warn!(resource_key = %self.key, "circuit forced open");
    }

    /// Close the circuit and clear failure counts.
    pub fn force_closed(&self) {
        let mut inner = self.lock();
        inner.close();
        info!(resource_key = %self.key, "circuit forced closed");
    }

    /// Return to the initial state, clearing counters and totals.
    pub fn reset(&self) {
        *self.lock() = BreakerInner::new();
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.lock();
        CircuitBreakerMetrics {
            key: self.key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_calls_made: inner.half_open_calls_made,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            ignored_failures: inner.ignored_failures,
            rejected_calls: inner.rejected_calls,
            open_for_ms: match inner.state {
                CircuitState::Open => inner
                    .opened_at
                    .map(|at| Instant::now().saturating_duration_since(at).as_millis() as u64),
                _ => None,
            },
        }
    }
}

/// Shared reference to a breaker registry.
pub type SharedBreakerRegistry = Arc<BreakerRegistry>;

/// One breaker per resource key, shared by every caller that holds the
/// registry.
///
/// Owned by whoever constructs the orchestrators and passed in explicitly,
/// so tests can use isolated registries.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<ResourceKey, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedBreakerRegistry {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The breaker for `key`, created with `config` on first use.
    ///
    /// Later calls return the same instance; the first config wins.
    pub fn get_or_create(
        &self,
        key: &ResourceKey,
        config: &CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        if let Some(existing) = breakers.get(key) {
            if existing.config() != config {
                debug!(resource_key = %key, "breaker already registered with a different config");
            }
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::new(key.clone(), config.clone()));
        breakers.insert(key.clone(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(key).cloned()
    }

    /// Reset one breaker in place. Returns `false` for an unknown key.
    pub fn reset(&self, key: &ResourceKey) -> bool {
        match self.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.lock().values() {
            breaker.reset();
        }
    }

    /// Metrics for every registered breaker, ordered by key.
    pub fn snapshot(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut metrics: Vec<_> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.key.cmp(&b.key));
        metrics
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
