//! OpenTelemetry-Compatible Span Helpers
//!
//! Structured `tracing` span builders for the execution engine. All spans
//! use dot-notation field names compatible with OpenTelemetry semantic
//! conventions.
//!
//! # Span Hierarchy
//!
//! ```text
//! tier.task                  (root, one per task)
//!   ├─ tier.run              (one per tier attempted)
//!   │   └─ tier.backend      (one per backend tried in the fallback chain)
//!   └─ tier.escalation       (tier change decision)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::otel;
//!
//! let span = otel::tier_span("task-42", 0, "cheap", 0.30);
//! // ... run the fallback chain inside the span ...
//! otel::record_tier_result(&span, &cqs, 0.28, false, 1450);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::error::ErrorKind;
use crate::escalation::{EscalationTrace, FinalStatus};
use crate::quality::CompositeQualityScore;

// ── Span Name Constants ──────────────────────────────────────────────

/// Root span for one task through the orchestrator.
pub const SPAN_TASK: &str = "tier.task";

/// One tier's fallback chain plus scoring.
pub const SPAN_TIER: &str = "tier.run";

/// One backend of a fallback chain, across all its retries.
pub const SPAN_BACKEND: &str = "tier.backend";

/// Tier escalation decision.
pub const SPAN_ESCALATION: &str = "tier.escalation";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_TASK_ID: &str = "tier.task.id";
pub const FIELD_TIER_COUNT: &str = "tier.count";
pub const FIELD_TIERS_RUN: &str = "tier.tiers_run";
pub const FIELD_TIER_INDEX: &str = "tier.index";
pub const FIELD_TIER_NAME: &str = "tier.name";
pub const FIELD_BACKEND_ID: &str = "tier.backend.id";
pub const FIELD_RESOURCE_KEY: &str = "tier.resource_key";
pub const FIELD_ATTEMPTS: &str = "tier.attempts";
pub const FIELD_SUCCESS: &str = "tier.success";
pub const FIELD_ERROR_KIND: &str = "tier.error_kind";
pub const FIELD_CQS: &str = "tier.cqs";
pub const FIELD_MEETS_THRESHOLD: &str = "tier.meets_threshold";
pub const FIELD_COST: &str = "tier.cost";
pub const FIELD_ESTIMATED_COST: &str = "tier.estimated_cost";
pub const FIELD_DEGRADED: &str = "tier.degraded";
pub const FIELD_FINAL_STATUS: &str = "tier.final_status";
pub const FIELD_DURATION_MS: &str = "tier.duration_ms";
pub const FIELD_FROM_TIER: &str = "tier.escalation.from";
pub const FIELD_TO_TIER: &str = "tier.escalation.to";
pub const FIELD_ESCALATION_REASON: &str = "tier.escalation.reason";
pub const FIELD_AUTO_APPROVED: &str = "tier.escalation.auto_approved";

// ── Span Builders ────────────────────────────────────────────────────
//
// `tracing` span macros need literal field names, so the builders spell
// them out; the `record_*` helpers go through the constants above.

/// Create the root span for a task.
///
/// Fields filled later via [`record_task_result`]: status, tiers run, cost, duration.
pub fn task_span(task_id: &str, tier_count: usize) -> Span {
    tracing::info_span!(
        "tier.task",
        "tier.task.id" = %task_id,
        "tier.count" = tier_count as u64,
        "tier.final_status" = tracing::field::Empty,
        "tier.tiers_run" = tracing::field::Empty,
        "tier.cost" = tracing::field::Empty,
        "tier.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_task_result(
    span: &Span,
    status: FinalStatus,
    tiers_run: usize,
    total_cost: f64,
    duration_ms: u64,
) {
    span.record(FIELD_FINAL_STATUS, status.to_string().as_str());
    span.record(FIELD_TIERS_RUN, tiers_run as u64);
    span.record(FIELD_COST, total_cost);
    span.record(FIELD_DURATION_MS, duration_ms);
}

/// Create a span for one tier.
///
/// Fields filled later via [`record_tier_result`]: cqs, threshold outcome, cost, degraded.
pub fn tier_span(task_id: &str, tier_index: usize, tier_name: &str, estimated_cost: f64) -> Span {
    tracing::info_span!(
        "tier.run",
        "tier.task.id" = %task_id,
        "tier.index" = tier_index as u64,
        "tier.name" = %tier_name,
        "tier.estimated_cost" = estimated_cost,
        "tier.cqs" = tracing::field::Empty,
        "tier.meets_threshold" = tracing::field::Empty,
        "tier.cost" = tracing::field::Empty,
        "tier.degraded" = tracing::field::Empty,
        "tier.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_tier_result(
    span: &Span,
    cqs: &CompositeQualityScore,
    cost: f64,
    degraded: bool,
    duration_ms: u64,
) {
    span.record(FIELD_CQS, cqs.score);
    span.record(FIELD_MEETS_THRESHOLD, cqs.meets_threshold);
    span.record(FIELD_COST, cost);
    span.record(FIELD_DEGRADED, degraded);
    span.record(FIELD_DURATION_MS, duration_ms);
}

/// Create a span for one backend of a fallback chain.
pub fn backend_span(task_id: &str, backend_id: &str, resource_key: &str) -> Span {
    tracing::debug_span!(
        "tier.backend",
        "tier.task.id" = %task_id,
        "tier.backend.id" = %backend_id,
        "tier.resource_key" = %resource_key,
        "tier.attempts" = tracing::field::Empty,
        "tier.success" = tracing::field::Empty,
        "tier.error_kind" = tracing::field::Empty,
    )
}

pub fn record_backend_result(span: &Span, attempts: usize, success: bool, kind: Option<ErrorKind>) {
    span.record(FIELD_ATTEMPTS, attempts as u64);
    span.record(FIELD_SUCCESS, success);
    if let Some(kind) = kind {
        span.record(FIELD_ERROR_KIND, kind.as_str());
    }
}

/// Create a span for an escalation decision. Point-in-time; all fields
/// are filled at creation.
pub fn escalation_span(
    task_id: &str,
    from_tier: &str,
    to_tier: &str,
    reason: &str,
    auto_approved: bool,
) -> Span {
    tracing::info_span!(
        "tier.escalation",
        "tier.task.id" = %task_id,
        "tier.escalation.from" = %from_tier,
        "tier.escalation.to" = %to_tier,
        "tier.escalation.reason" = %reason,
        "tier.escalation.auto_approved" = auto_approved,
    )
}

// ── Trace Summary ────────────────────────────────────────────────────

/// Span-level counts for one task, derived from its trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanSummary {
    pub tiers: u32,
    pub backends_tried: u32,
    pub attempts: u32,
    pub circuit_rejections: u32,
    pub fallbacks_served: u32,
    pub degraded_tiers: u32,
    pub escalations: u32,
    pub total_cost: f64,
}

impl SpanSummary {
    pub fn from_trace(trace: &EscalationTrace) -> Self {
        let mut summary = Self {
            tiers: trace.tiers.len() as u32,
            escalations: trace.escalations.len() as u32,
            total_cost: trace.total_cost,
            ..Self::default()
        };
        for tier in &trace.tiers {
            if tier.degraded {
                summary.degraded_tiers += 1;
            }
            for (pos, backend) in tier.attempts.iter().enumerate() {
                summary.backends_tried += 1;
                summary.attempts += backend.attempts.len() as u32;
                if backend.circuit_was_open() {
                    summary.circuit_rejections += 1;
                }
                if backend.served && pos > 0 {
                    summary.fallbacks_served += 1;
                }
            }
        }
        summary
    }
}

impl fmt::Display for SpanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tiers={} backends={} attempts={} circuit_open={} fallbacks={} degraded={} escalations={} cost={:.4}",
            self.tiers,
            self.backends_tried,
            self.attempts,
            self.circuit_rejections,
            self.fallbacks_served,
            self.degraded_tiers,
            self.escalations,
            self.total_cost,
        )
    }
}
