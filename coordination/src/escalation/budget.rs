//! Per-invocation cost accounting.

use serde::{Deserialize, Serialize};

/// Slack for floating point sums of prices.
const COST_EPSILON: f64 = 1e-9;

/// Running spend for one orchestrator invocation.
///
/// `spent` only ever grows; negative costs reported by a backend are
/// treated as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub max_cost: Option<f64>,
    pub spent: f64,
    pub auto_approve_under: Option<f64>,
}

impl Budget {
    pub fn new(max_cost: Option<f64>, auto_approve_under: Option<f64>) -> Self {
        Self {
            max_cost,
            spent: 0.0,
            auto_approve_under,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Whether a tier estimated at `estimate` may start.
    pub fn can_afford(&self, estimate: f64) -> bool {
        match self.max_cost {
            Some(max) => self.spent + estimate.max(0.0) <= max + COST_EPSILON,
            None => true,
        }
    }

    pub fn charge(&mut self, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.spent += cost;
        }
    }

    /// Whether escalating from the current spend needs an approval signal.
    pub fn needs_approval(&self) -> bool {
        self.auto_approve_under
            .is_some_and(|threshold| self.spent >= threshold)
    }

    pub fn remaining(&self) -> Option<f64> {
        self.max_cost.map(|max| (max - self.spent).max(0.0))
    }
}
