//! Fallback chain: ordered alternative backends for the same task.
//!
//! ```text
//! FallbackChain::execute(task)
//!   ├─ primary serves           → level: Full,        degraded: false
//!   ├─ primary fails, #k serves → level: Partial,     degraded: false, warnings
//!   └─ every backend fails      → level: Unavailable, degraded: true,  terminal default
//! ```
//!
//! Each backend runs through its own [`RetryExecutor`] bound to its own
//! [`CircuitBreaker`]. The first success wins; later backends are never
//! invoked. Cancellation stops the chain immediately.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use super::circuit_breaker::{CircuitBreaker, ResourceKey};
use super::retry::{Attempt, RetryExecutor};
use crate::backend::{Backend, BackendResult, Task};
use crate::error::{ErrorKind, ExecutionError};
use crate::otel;

/// How much of the chain's preferred capability served the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// The primary backend served.
    Full,
    /// A fallback backend served.
    Partial,
    /// Nothing served; the terminal default was returned.
    Unavailable,
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Everything that happened while one backend of the chain was tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendAttempt {
    pub backend_id: String,
    pub resource_key: ResourceKey,
    /// Whether this backend produced the chain's result.
    pub served: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: Vec<Attempt>,
}

impl BackendAttempt {
    pub fn circuit_was_open(&self) -> bool {
        self.attempts
            .last()
            .is_some_and(|a| matches!(a.outcome, super::retry::AttemptOutcome::CircuitOpen))
    }

    /// Cost reported by every attempt against this backend.
    pub fn cost(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost).sum()
    }
}

/// Result of running a chain, with the full per-backend trace.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub result: BackendResult,
    pub level: DegradationLevel,
    /// True only when the terminal default was returned.
    pub degraded: bool,
    pub served_by: Option<String>,
    pub attempts: Vec<BackendAttempt>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl FallbackOutcome {
    /// Total number of individual attempts across every backend.
    pub fn attempt_count(&self) -> usize {
        self.attempts.iter().map(|b| b.attempts.len()).sum()
    }

    /// Actual spend of the chain: the serving call plus every failed
    /// attempt that reported a cost. Non-zero even when degraded.
    pub fn total_cost(&self) -> f64 {
        self.attempts.iter().map(BackendAttempt::cost).sum()
    }
}

struct FallbackLink {
    backend: Arc<dyn Backend>,
    retry: RetryExecutor,
    breaker: Arc<CircuitBreaker>,
}

/// Ordered backends tried in sequence until one succeeds.
pub struct FallbackChain {
    name: String,
    links: Vec<FallbackLink>,
    terminal_default: serde_json::Value,
}

impl fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChain")
            .field("name", &self.name)
            .field("backends", &self.backend_ids())
            .field("terminal_default", &self.terminal_default)
            .finish()
    }
}

impl FallbackChain {
    /// Empty chain; its terminal default is `null`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            links: Vec::new(),
            terminal_default: serde_json::Value::Null,
        }
    }

    /// Append a backend, protected by `breaker` and retried by `retry`.
    pub fn add_backend(
        mut self,
        backend: Arc<dyn Backend>,
        retry: RetryExecutor,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        self.links.push(FallbackLink {
            backend,
            retry,
            breaker,
        });
        self
    }

    /// Payload returned (marked degraded) when every backend fails.
    pub fn with_terminal_default(mut self, payload: serde_json::Value) -> Self {
        self.terminal_default = payload;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn terminal_default(&self) -> &serde_json::Value {
        &self.terminal_default
    }

    pub fn backend_ids(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.backend.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Try each backend in order and return the first success, or the
    /// terminal default marked `degraded` once all have failed.
    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> FallbackOutcome {
        let mut trace = Vec::with_capacity(self.links.len());
        let mut warnings = Vec::new();

        for (idx, link) in self.links.iter().enumerate() {
            let backend_id = link.backend.id().to_string();
            let span = otel::backend_span(&task.id, &backend_id, link.breaker.key().as_str());

            let outcome = link
                .retry
                .execute(&link.breaker, cancel, |timeout| {
                    link.backend.call(task, timeout)
                })
                .instrument(span.clone())
                .await;

            let mut entry = BackendAttempt {
                backend_id: backend_id.clone(),
                resource_key: link.breaker.key().clone(),
                served: false,
                error_kind: None,
                error: None,
                attempts: outcome.attempts,
            };

            match outcome.result {
                Ok(result) => {
                    otel::record_backend_result(&span, entry.attempts.len(), true, None);
                    entry.served = true;
                    trace.push(entry);
                    let level = if idx == 0 {
                        DegradationLevel::Full
                    } else {
                        warnings.push(format!(
                            "{}: primary backend(s) failed, served by fallback '{}'",
                            self.name, backend_id
                        ));
                        info!(
                            chain = %self.name,
                            backend = %backend_id,
                            position = idx,
                            "fallback backend served the task"
                        );
                        DegradationLevel::Partial
                    };
                    return FallbackOutcome {
                        result,
                        level,
                        degraded: false,
                        served_by: Some(backend_id),
                        attempts: trace,
                        warnings,
                        cancelled: false,
                    };
                }
                Err(err) => {
                    otel::record_backend_result(&span, entry.attempts.len(), false, err.kind());
                    warnings.push(format!("{} '{}' failed: {}", self.name, backend_id, err));
                    entry.error_kind = err.kind();
                    entry.error = Some(err.to_string());
                    trace.push(entry);

                    if matches!(err, ExecutionError::Cancelled) {
                        warn!(chain = %self.name, backend = %backend_id, "chain cancelled");
                        return self.terminal(trace, warnings, true);
                    }
                }
            }
        }

        warnings.push(format!(
            "{}: all {} backends exhausted",
            self.name,
            self.links.len()
        ));
        warn!(
            chain = %self.name,
            backends = self.links.len(),
            "every backend failed, returning degraded default"
        );
        self.terminal(trace, warnings, false)
    }

    fn terminal(
        &self,
        attempts: Vec<BackendAttempt>,
        warnings: Vec<String>,
        cancelled: bool,
    ) -> FallbackOutcome {
        FallbackOutcome {
            result: BackendResult::degraded(self.terminal_default.clone()),
            level: DegradationLevel::Unavailable,
            degraded: true,
            served_by: None,
            attempts,
            warnings,
            cancelled,
        }
    }
}
