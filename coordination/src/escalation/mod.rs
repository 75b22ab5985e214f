//! Escalation: Cost/Quality Driven Tier Routing
//!
//! Routes a task through an ordered ladder of tiers, each with its own
//! fallback chain and quality threshold, under a per-task budget.
//!
//! # Escalation Ladder
//!
//! ```text
//! cheap tier ── CQS ≥ threshold ──────────────► satisfied
//!     │
//!     ├─ CQS below threshold, or every backend failed
//!     ├─ next tier fits in max_cost?  no ─────► budget_exhausted
//!     ├─ spent ≥ auto_approve_under?  approval gate says no ─► budget_exhausted
//!     ▼
//! capable tier ── ...
//!     │
//!     ▼
//! premium tier ── still below threshold ─────► exhausted_all_tiers (best result)
//! ```

pub mod approval;
pub mod budget;
pub mod config;
pub mod orchestrator;
pub mod trace;

pub use approval::{ApprovalGate, ApprovalRequest, AutoApprove, DenyAll, StaticApproval};
pub use budget::Budget;
pub use config::{BackendRef, EscalationConfig, TierConfig};
pub use orchestrator::{OrchestratorBuilder, TierEscalationOrchestrator};
pub use trace::{
    EscalationOutcome, EscalationReason, EscalationRecord, EscalationTrace, FinalStatus,
    StopReason, TierRecord,
};
