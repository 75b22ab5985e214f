//! Bounded retry of a single backend call, gated by its circuit breaker.
//!
//! For attempt `n` in `1..=max_attempts`:
//!
//! 1. Breaker refuses → `CircuitOpen`, immediately. No sleep, no call.
//! 2. Call succeeds → `record_success`, return the result.
//! 3. Call fails with a kind outside `retryable_kinds` → `record_failure`,
//!    return `Backend(err)` without using the remaining attempts.
//! 4. Retryable failure with attempts left → `record_failure`, sleep
//!    `delay(n)`, continue.
//! 5. Retryable failure on the last attempt → `record_failure`, return
//!    `RetryExhausted`.
//!
//! Every attempt that reached the backend updates the breaker exactly once.
//! The call and the backoff sleep both race the caller's cancellation token.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::circuit_breaker::CircuitBreaker;
use crate::backend::BackendResult;
use crate::error::{BackendError, ConfigError, ErrorKind, ExecutionError};

/// Retry settings for one backend.
///
/// ```toml
/// [retry]
/// max_attempts = 3
/// backoff_factor = 2.0
/// initial_delay_ms = 200
/// max_delay_ms = 10000
/// jitter = true
/// retryable_kinds = ["timeout", "rate_limit", "server_error", "connection_error"]
/// call_timeout_ms = 60000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retryable_kinds: Vec<ErrorKind>,
    /// Per-call timeout; exceeding it is a `timeout` failure.
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_factor: 2.0,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: true,
            retryable_kinds: ErrorKind::transient().to_vec(),
            call_timeout_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay_ms = initial.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind != ErrorKind::Cancelled && self.retryable_kinds.contains(&kind)
    }

    /// Backoff schedule described by this config.
    pub fn policy(&self) -> Result<BackoffPolicy, ConfigError> {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            self.backoff_factor,
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::validation("max_attempts", "must be at least 1"));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "call_timeout_ms",
                "must be greater than 0",
            ));
        }
        self.policy().map(|_| ())
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure { kind: ErrorKind, message: String },
    CircuitOpen,
}

/// One try of a backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-indexed.
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    /// Cost the backend reported for this attempt, failed ones included.
    #[serde(default)]
    pub cost: f64,
    /// Backoff slept after this attempt before the next one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

impl Attempt {
    fn new(attempt_number: u32, started_at: DateTime<Utc>, elapsed: Duration, outcome: AttemptOutcome) -> Self {
        Self {
            attempt_number,
            started_at,
            duration_ms: elapsed.as_millis() as u64,
            outcome,
            cost: 0.0,
            backoff_ms: None,
        }
    }

    fn with_cost(mut self, cost: f64) -> Self {
        self.cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success)
    }
}

/// Result of [`RetryExecutor::execute`] plus the attempts that produced it.
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<BackendResult, ExecutionError>,
    pub attempts: Vec<Attempt>,
}

impl RetryOutcome {
    /// Number of backoff sleeps taken.
    pub fn sleeps(&self) -> usize {
        self.attempts.iter().filter(|a| a.backoff_ms.is_some()).count()
    }

    /// Everything the backend charged across all attempts.
    pub fn cost(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost).sum()
    }
}

/// Runs a call with bounded retries and exponential backoff.
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    policy: BackoffPolicy,
    rng: Mutex<StdRng>,
}

impl RetryExecutor {
    /// Executor with jitter seeded from the OS.
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        Self::build(config, StdRng::from_os_rng())
    }

    /// Executor whose jitter sequence is fixed by `seed`.
    pub fn with_seed(config: RetryConfig, seed: u64) -> Result<Self, ConfigError> {
        Self::build(config, StdRng::seed_from_u64(seed))
    }

    fn build(config: RetryConfig, rng: StdRng) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = config.policy()?;
        Ok(Self {
            config,
            policy,
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.policy
            .delay(attempt, &mut *rng)
            .unwrap_or_else(|_| self.policy.max_delay())
    }

    /// Run `call` until it succeeds, fails permanently, exhausts its
    /// attempts, is refused by `breaker`, or `cancel` fires.
    ///
    /// `call` receives the per-call timeout so backends can honour it too.
    pub async fn execute<F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        mut call: F,
    ) -> RetryOutcome
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<BackendResult, BackendError>>,
    {
        let timeout = self.config.call_timeout();
        let max_attempts = self.config.max_attempts;
        let mut attempts = Vec::new();

        for n in 1..=max_attempts {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(ExecutionError::Cancelled),
                    attempts,
                };
            }

            let started_at = Utc::now();
            let started = Instant::now();

            if !breaker.allow_call() {
                debug!(resource_key = %breaker.key(), attempt = n, "circuit open, failing fast");
                attempts.push(Attempt::new(n, started_at, Duration::ZERO, AttemptOutcome::CircuitOpen));
                return RetryOutcome {
                    result: Err(ExecutionError::CircuitOpen {
                        key: breaker.key().clone(),
                    }),
                    attempts,
                };
            }

            // an unsuccessful result may still have been billed
            let (outcome, reported_cost) = tokio::select! {
                biased;
                _ = cancel.cancelled() => (Err(BackendError::cancelled()), 0.0),
                res = tokio::time::timeout(timeout, call(timeout)) => match res {
                    Ok(Ok(result)) => {
                        let cost = result.cost;
                        (result.into_outcome(), cost)
                    }
                    Ok(Err(err)) => (Err(err), 0.0),
                    Err(_) => (
                        Err(BackendError::timeout(format!(
                            "call exceeded {}ms",
                            timeout.as_millis()
                        ))),
                        0.0,
                    ),
                },
            };
            let elapsed = started.elapsed();

            let err = match outcome {
                Ok(mut result) => {
                    breaker.record_success();
                    if result.latency_ms == 0 {
                        result.latency_ms = elapsed.as_millis() as u64;
                    }
                    debug!(resource_key = %breaker.key(), attempt = n, "call succeeded");
                    attempts.push(
                        Attempt::new(n, started_at, elapsed, AttemptOutcome::Success)
                            .with_cost(result.cost),
                    );
                    return RetryOutcome {
                        result: Ok(result),
                        attempts,
                    };
                }
                Err(err) => err,
            };

            breaker.record_failure(err.kind);
            let mut attempt = Attempt::new(
                n,
                started_at,
                elapsed,
                AttemptOutcome::Failure {
                    kind: err.kind,
                    message: err.message.clone(),
                },
            )
            .with_cost(reported_cost);

            if err.kind == ErrorKind::Cancelled {
                attempts.push(attempt);
                return RetryOutcome {
                    result: Err(ExecutionError::Cancelled),
                    attempts,
                };
            }

            if !self.config.is_retryable(err.kind) {
                debug!(resource_key = %breaker.key(), attempt = n, kind = %err.kind, "non-retryable failure");
                attempts.push(attempt);
                return RetryOutcome {
                    result: Err(ExecutionError::Backend(err)),
                    attempts,
                };
            }

            if n == max_attempts {
                warn!(
                    resource_key = %breaker.key(),
                    attempts = n,
                    kind = %err.kind,
                    "retries exhausted"
                );
                attempts.push(attempt);
                return RetryOutcome {
                    result: Err(ExecutionError::RetryExhausted {
                        attempts: n,
                        last: err,
                    }),
                    attempts,
                };
            }

            let delay = self.next_delay(n);
            attempt.backoff_ms = Some(delay.as_millis() as u64);
            attempts.push(attempt);
            debug!(
                resource_key = %breaker.key(),
                attempt = n,
                kind = %err.kind,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(ExecutionError::Cancelled),
                        attempts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts >= 1 is validated at construction, so the loop always returns.
        RetryOutcome {
            result: Err(ExecutionError::Cancelled),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(100), Duration::from_secs(2))
            .without_jitter()
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "retry:test",
            CircuitBreakerConfig::new(threshold, Duration::from_secs(60)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let exec = RetryExecutor::with_seed(config(3), 1).unwrap();
        let cb = breaker(3);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| async {
                Ok(BackendResult::ok(json!("done"), 0.2))
            })
            .await;
        assert_eq!(out.result.as_ref().unwrap().payload, json!("done"));
        assert_eq!(out.attempts.len(), 1);
        assert_eq!(out.sleeps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let exec = RetryExecutor::with_seed(config(3), 1).unwrap();
        let cb = breaker(5);
        let calls = AtomicU32::new(0);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(BackendError::new(ErrorKind::RateLimit, "429"))
                    } else {
                        Ok(BackendResult::ok(json!(n), 0.1))
                    }
                }
            })
            .await;
        assert!(out.result.is_ok());
        assert_eq!(out.attempts.len(), 2);
        assert_eq!(out.attempts[0].backoff_ms, Some(100));
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_sleeps_between_attempts_only() {
        let exec = RetryExecutor::with_seed(config(3), 1).unwrap();
        let cb = breaker(10);
        let calls = AtomicU32::new(0);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::timeout("slow")) }
            })
            .await;
        assert!(matches!(
            out.result,
            Err(ExecutionError::RetryExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.sleeps(), 2);
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_short_circuits() {
        let exec = RetryExecutor::with_seed(config(5), 1).unwrap();
        let cb = breaker(10);
        let calls = AtomicU32::new(0);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::new(ErrorKind::ValidationError, "bad input")) }
            })
            .await;
        assert!(matches!(out.result, Err(ExecutionError::Backend(ref e)) if e.kind == ErrorKind::ValidationError));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.metrics().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_never_calls_backend() {
        let exec = RetryExecutor::with_seed(config(3), 1).unwrap();
        let cb = breaker(1);
        cb.record_failure(ErrorKind::ServerError);
        let calls = AtomicU32::new(0);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(BackendResult::ok(json!(1), 0.0)) }
            })
            .await;
        assert!(matches!(out.result, Err(ExecutionError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.attempts[0].outcome, AttemptOutcome::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_mid_retry() {
        let exec = RetryExecutor::with_seed(config(5), 1).unwrap();
        let cb = breaker(2);
        let calls = AtomicU32::new(0);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::new(ErrorKind::ServerError, "500")) }
            })
            .await;
        assert!(matches!(out.result, Err(ExecutionError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_retryable_timeout() {
        let cfg = config(2).with_call_timeout(Duration::from_millis(50));
        let exec = RetryExecutor::with_seed(cfg, 1).unwrap();
        let cb = breaker(10);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(BackendResult::ok(json!(1), 0.0))
            })
            .await;
        match out.result {
            Err(ExecutionError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last.kind, ErrorKind::Timeout);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_call() {
        let exec = RetryExecutor::with_seed(config(3), 1).unwrap();
        let cb = breaker(10);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let out = exec
            .execute(&cb, &cancel, |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(BackendResult::ok(json!(1), 0.0))
            })
            .await;
        assert!(matches!(out.result, Err(ExecutionError::Cancelled)));
        assert_eq!(
            out.attempts[0].outcome,
            AttemptOutcome::Failure {
                kind: ErrorKind::Cancelled,
                message: "cancelled by caller".to_string()
            }
        );
        // cancelled is excluded from breaker accounting by default
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cfg = config(3).with_delays(Duration::from_secs(10), Duration::from_secs(10));
        let exec = RetryExecutor::with_seed(cfg, 1).unwrap();
        let cb = breaker(10);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let calls = AtomicU32::new(0);
        let out = exec
            .execute(&cb, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::timeout("slow")) }
            })
            .await;
        assert!(matches!(out.result, Err(ExecutionError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsuccessful_result_cost_is_kept() {
        let exec = RetryExecutor::with_seed(config(2), 1).unwrap();
        let cb = breaker(10);
        let calls = AtomicU32::new(0);
        let out = exec
            .execute(&cb, &CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(BackendResult {
                            payload: json!(null),
                            cost: 0.4,
                            latency_ms: 0,
                            success: false,
                            error: Some(BackendError::new(ErrorKind::ServerError, "partial run")),
                        })
                    } else {
                        Ok(BackendResult::ok(json!("done"), 0.25))
                    }
                }
            })
            .await;
        assert!(out.result.is_ok());
        assert_eq!(out.attempts[0].cost, 0.4);
        assert_eq!(out.attempts[1].cost, 0.25);
        assert!((out.cost() - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::default().with_max_attempts(0).validate().is_err());
        let mut cfg = RetryConfig::default();
        cfg.backoff_factor = 1.0;
        assert!(RetryExecutor::new(cfg).is_err());
    }

    #[test]
    fn test_cancelled_never_retryable() {
        let mut cfg = RetryConfig::default();
        cfg.retryable_kinds.push(ErrorKind::Cancelled);
        assert!(!cfg.is_retryable(ErrorKind::Cancelled));
        assert!(cfg.is_retryable(ErrorKind::Timeout));
        assert!(!cfg.is_retryable(ErrorKind::AuthError));
    }
}
