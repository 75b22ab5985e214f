//! Resilience: Retry, Circuit Breaking and Fallback
//!
//! The per-backend protection layer every tier runs through.
//!
//! ```text
//! FallbackChain
//!   ├─ backend #1 ── RetryExecutor ── CircuitBreaker("provider:model")
//!   ├─ backend #2 ── RetryExecutor ── CircuitBreaker(...)
//!   └─ terminal default (degraded)
//! ```
//!
//! Breakers are shared across concurrent tasks through a [`BreakerRegistry`];
//! retry executors and chains are per tier.

pub mod backoff;
pub mod circuit_breaker;
pub mod fallback;
pub mod retry;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    ResourceKey, SharedBreakerRegistry,
};
pub use fallback::{BackendAttempt, DegradationLevel, FallbackChain, FallbackOutcome};
pub use retry::{Attempt, AttemptOutcome, RetryConfig, RetryExecutor, RetryOutcome};
