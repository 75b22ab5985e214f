//! Approval gate consulted before escalating past `auto_approve_under`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the orchestrator asks an approver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub from_tier: String,
    pub to_tier: String,
    pub spent_so_far: f64,
    /// Estimated cost of the tier about to run.
    pub next_tier_estimate: f64,
    pub max_cost: Option<f64>,
}

/// External approval signal for costly escalations.
///
/// A `false` answer ends the task with status `budget_exhausted`.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> bool;
}

/// Approves every escalation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        true
    }
}

/// Refuses every escalation that needs approval.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        false
    }
}

/// Fixed answer, e.g. from a command-line flag.
#[derive(Debug, Clone, Copy)]
pub struct StaticApproval(pub bool);

#[async_trait]
impl ApprovalGate for StaticApproval {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            task_id: "t1".into(),
            from_tier: "cheap".into(),
            to_tier: "premium".into(),
            spent_so_far: 0.6,
            next_tier_estimate: 0.3,
            max_cost: Some(1.0),
        }
    }

    #[tokio::test]
    async fn test_builtin_gates() {
        assert!(AutoApprove.approve(&request()).await);
        assert!(!DenyAll.approve(&request()).await);
        assert!(StaticApproval(true).approve(&request()).await);
        assert!(!StaticApproval(false).approve(&request()).await);
    }
}
