//! Quality Assessment: Composite Quality Score
//!
//! Turns a backend result into a single score the escalation orchestrator
//! can compare against a tier's threshold.
//!
//! ```text
//! BackendResult ─┬─ numeric signals ── weighted mean ──┐
//!                └─ boolean gates ──── all must pass ──┴─► CQS { score, meets_threshold }
//! ```

pub mod assessor;
pub mod signal;

pub use assessor::{CompositeQualityScore, QualityAssessor};
pub use signal::{
    validate_signals, QualitySignal, SignalExtractor, SignalSource, SignalSpec, SignalValue,
};
