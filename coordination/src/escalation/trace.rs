//! Escalation Trace: the audit record of one task execution

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendResult;
use crate::quality::CompositeQualityScore;
use crate::resilience::{BackendAttempt, DegradationLevel};

/// Terminal state of an orchestrator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Satisfied,
    BudgetExhausted,
    ExhaustedAllTiers,
    Cancelled,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied => write!(f, "satisfied"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::ExhaustedAllTiers => write!(f, "exhausted_all_tiers"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened on one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRecord {
    pub tier_index: usize,
    pub tier: String,
    /// Backend that served the result, if any did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub attempts: Vec<BackendAttempt>,
    pub cqs: CompositeQualityScore,
    pub result: BackendResult,
    /// Actual cost charged by this tier.
    pub cost: f64,
    pub estimated_cost: f64,
    /// Running spend after this tier.
    pub spent_after: f64,
    pub level: DegradationLevel,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Why the orchestrator moved up a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    /// The tier produced output but scored under its threshold.
    LowQuality {
        score: f64,
        threshold: f64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_gates: Vec<String>,
    },
    /// Every backend of the tier failed.
    TierUnavailable,
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowQuality {
                score,
                threshold,
                failed_gates,
            } if failed_gates.is_empty() => {
                write!(f, "cqs {:.3} below threshold {:.3}", score, threshold)
            }
            Self::LowQuality { failed_gates, .. } => {
                write!(f, "gates failed: {}", failed_gates.join(", "))
            }
            Self::TierUnavailable => write!(f, "all backends failed"),
        }
    }
}

/// One tier change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub from_tier: String,
    pub to_tier: String,
    pub reason: EscalationReason,
    /// False when an approval gate had to be consulted.
    pub auto_approved: bool,
    pub spent_so_far: f64,
    pub timestamp: DateTime<Utc>,
}

/// Why the run stopped early, when it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// Running the next tier would exceed `max_cost`.
    BudgetExceeded {
        tier: String,
        spent: f64,
        estimate: f64,
        max_cost: f64,
    },
    /// The approval gate refused the escalation.
    ApprovalDenied { tier: String, spent: f64 },
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded {
                tier,
                spent,
                estimate,
                max_cost,
            } => write!(
                f,
                "tier '{}' would cost {:.4} on top of {:.4} (max {:.4})",
                tier, estimate, spent, max_cost
            ),
            Self::ApprovalDenied { tier, spent } => {
                write!(f, "escalation to '{}' denied at spend {:.4}", tier, spent)
            }
            Self::Cancelled => write!(f, "cancelled by caller"),
        }
    }
}

/// Authoritative record of one task execution. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTrace {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    /// Strict chronological tier order.
    pub tiers: Vec<TierRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalations: Vec<EscalationRecord>,
    pub final_status: FinalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Index into `tiers` of the returned result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<usize>,
    pub total_cost: f64,
    pub total_duration_ms: u64,
}

impl EscalationTrace {
    pub fn selected_record(&self) -> Option<&TierRecord> {
        self.selected.and_then(|i| self.tiers.get(i))
    }

    /// Number of backend attempts across every tier.
    pub fn attempt_count(&self) -> usize {
        self.tiers
            .iter()
            .flat_map(|t| &t.attempts)
            .map(|b| b.attempts.len())
            .sum()
    }
}

impl fmt::Display for EscalationTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task={} status={} tiers={} cost={:.4} duration={}ms",
            self.task_id,
            self.final_status,
            self.tiers.len(),
            self.total_cost,
            self.total_duration_ms
        )
    }
}

/// What the caller receives from the orchestrator.
#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    pub status: FinalStatus,
    /// Best available result, possibly degraded. `None` only when no tier ran.
    pub result: Option<BackendResult>,
    pub cqs: Option<CompositeQualityScore>,
    pub trace: EscalationTrace,
}

impl EscalationOutcome {
    pub fn is_satisfied(&self) -> bool {
        self.status == FinalStatus::Satisfied
    }

    pub fn is_degraded(&self) -> bool {
        self.trace.selected_record().is_some_and(|r| r.degraded)
    }
}
