//! Adaptive Multi-Tier Execution Engine
//!
//! Routes a unit of work across increasingly capable (and expensive)
//! execution backends, escalating on a composite quality score and
//! protecting each backend with retries and a circuit breaker.
//!
//! # Components
//!
//! - [`resilience`]: backoff policy, circuit breakers and their registry,
//!   retry executor, fallback chain
//! - [`quality`]: signal extractors and the composite quality score
//! - [`escalation`]: tier configuration, budget, approval gate and the
//!   orchestrator that produces an [`EscalationTrace`]
//! - [`telemetry`]: sinks receiving one trace per task
//! - [`otel`]: OpenTelemetry-style span builders
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::{EscalationConfig, TierEscalationOrchestrator, Task};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = EscalationConfig::load("escalation.toml")?;
//! let orchestrator = TierEscalationOrchestrator::builder(config)
//!     .backend(cheap_backend)
//!     .backend(premium_backend)
//!     .build()?;
//! let outcome = orchestrator
//!     .execute(&Task::new("task-1", payload), CancellationToken::new())
//!     .await?;
//! println!("{}", outcome.trace);
//! ```

pub mod backend;
pub mod error;
pub mod escalation;
pub mod otel;
pub mod quality;
pub mod resilience;
pub mod telemetry;

pub use backend::{Backend, BackendResult, Task};
pub use error::{
    BackendError, ConfigError, EngineError, EngineResult, ErrorKind, ExecutionError,
};

pub use escalation::{
    ApprovalGate, ApprovalRequest, AutoApprove, BackendRef, Budget, DenyAll, EscalationConfig,
    EscalationOutcome, EscalationTrace, FinalStatus, OrchestratorBuilder, StaticApproval,
    TierConfig, TierEscalationOrchestrator, TierRecord,
};

pub use quality::{
    CompositeQualityScore, QualityAssessor, QualitySignal, SignalExtractor, SignalSource,
    SignalSpec, SignalValue,
};

pub use resilience::{
    Attempt, AttemptOutcome, BackendAttempt, BackoffPolicy, BreakerRegistry, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, DegradationLevel, FallbackChain,
    FallbackOutcome, ResourceKey, RetryConfig, RetryExecutor, RetryOutcome,
    SharedBreakerRegistry,
};

pub use telemetry::{JsonlTelemetry, MemoryTelemetry, TelemetryError, TelemetryRecorder};
