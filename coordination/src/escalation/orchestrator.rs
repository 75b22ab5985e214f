//! Tier Escalation Orchestrator
//!
//! Drives one task up the tier ladder until a tier's output meets its
//! quality threshold, the budget runs out, or the ladder ends.
//!
//! ```text
//! for each tier (cheapest first):
//!   spent + estimate > max_cost ?           → budget_exhausted (best so far)
//!   not the first tier and spent ≥ auto_approve_under ?
//!       approval gate says no               → budget_exhausted (best so far)
//!   FallbackChain::execute → charge actual cost → QualityAssessor::score
//!   meets_threshold ?                       → satisfied (this tier)
//!   last tier ?                             → exhausted_all_tiers (best overall)
//! ```
//!
//! A tier whose every backend failed scores zero and escalates exactly like
//! low-quality output; the trace keeps the two apart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::approval::{ApprovalGate, ApprovalRequest, AutoApprove};
use super::budget::Budget;
use super::config::{EscalationConfig, TierConfig};
use super::trace::{
    EscalationOutcome, EscalationReason, EscalationRecord, EscalationTrace, FinalStatus,
    StopReason, TierRecord,
};
use crate::backend::{Backend, Task};
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::otel;
use crate::quality::{CompositeQualityScore, QualityAssessor, SignalExtractor};
use crate::resilience::{
    BreakerRegistry, FallbackChain, RetryExecutor, SharedBreakerRegistry,
};
use crate::telemetry::TelemetryRecorder;

struct PreparedTier {
    name: String,
    unit_price: f64,
    chain: FallbackChain,
    assessor: QualityAssessor,
}

/// Builds a [`TierEscalationOrchestrator`] from configuration plus the
/// collaborators it cannot read from a file.
pub struct OrchestratorBuilder {
    config: EscalationConfig,
    backends: HashMap<String, Arc<dyn Backend>>,
    registry: Option<SharedBreakerRegistry>,
    approval: Option<Arc<dyn ApprovalGate>>,
    telemetry: Vec<Arc<dyn TelemetryRecorder>>,
    extractors: HashMap<String, Arc<dyn SignalExtractor>>,
    jitter_seed: Option<u64>,
}

impl OrchestratorBuilder {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            backends: HashMap::new(),
            registry: None,
            approval: None,
            telemetry: Vec::new(),
            extractors: HashMap::new(),
            jitter_seed: None,
        }
    }

    /// Register a backend under its own id.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.id().to_string(), backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn Backend>>) -> Self {
        for backend in backends {
            self = self.backend(backend);
        }
        self
    }

    /// Share circuit state with other orchestrators. Defaults to a fresh registry.
    pub fn registry(mut self, registry: SharedBreakerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to [`AutoApprove`].
    pub fn approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    pub fn telemetry(mut self, recorder: Arc<dyn TelemetryRecorder>) -> Self {
        self.telemetry.push(recorder);
        self
    }

    pub fn extractor(mut self, name: impl Into<String>, extractor: Arc<dyn SignalExtractor>) -> Self {
        self.extractors.insert(name.into(), extractor);
        self
    }

    /// Make retry jitter reproducible.
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Validate the configuration and wire every tier's fallback chain.
    pub fn build(self) -> Result<TierEscalationOrchestrator, ConfigError> {
        self.config.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| BreakerRegistry::new().shared());

        let mut tiers = Vec::with_capacity(self.config.tiers.len());
        let mut slot: u64 = 0;
        for tier in &self.config.tiers {
            let mut chain = FallbackChain::new(tier.name.clone());
            if let Some(default) = &tier.terminal_default {
                chain = chain.with_terminal_default(default.clone());
            }
            for backend_ref in &tier.backends {
                let backend = self.backends.get(&backend_ref.id).cloned().ok_or_else(|| {
                    ConfigError::UnknownBackend {
                        tier: tier.name.clone(),
                        backend: backend_ref.id.clone(),
                    }
                })?;
                let retry_config = self.config.retry_for(backend_ref);
                let retry = match self.jitter_seed {
                    Some(seed) => RetryExecutor::with_seed(retry_config, seed.wrapping_add(slot))?,
                    None => RetryExecutor::new(retry_config)?,
                };
                slot += 1;
                let breaker =
                    registry.get_or_create(&backend_ref.key(), &self.config.breaker_for(backend_ref));
                chain = chain.add_backend(backend, retry, breaker);
            }
            let assessor = QualityAssessor::with_extractors(
                tier.signals.clone(),
                tier.quality_threshold,
                &self.extractors,
            )?;
            tiers.push(prepare(tier, chain, assessor));
        }

        Ok(TierEscalationOrchestrator {
            config: self.config,
            tiers,
            registry,
            approval: self.approval.unwrap_or_else(|| Arc::new(AutoApprove)),
            telemetry: self.telemetry,
        })
    }
}

fn prepare(tier: &TierConfig, chain: FallbackChain, assessor: QualityAssessor) -> PreparedTier {
    PreparedTier {
        name: tier.name.clone(),
        unit_price: tier.unit_price,
        chain,
        assessor,
    }
}

/// Runs tasks through the configured tier ladder.
///
/// Safe to share between concurrent tasks; each call to
/// [`execute`](Self::execute) owns its own budget and trace.
pub struct TierEscalationOrchestrator {
    config: EscalationConfig,
    tiers: Vec<PreparedTier>,
    registry: SharedBreakerRegistry,
    approval: Arc<dyn ApprovalGate>,
    telemetry: Vec<Arc<dyn TelemetryRecorder>>,
}

impl TierEscalationOrchestrator {
    pub fn builder(config: EscalationConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    pub fn registry(&self) -> &SharedBreakerRegistry {
        &self.registry
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name.as_str()).collect()
    }

    /// Run `task` up the ladder.
    ///
    /// Always returns a structured outcome, except when every tier that ran
    /// degraded and none produced a payload: that is
    /// [`EngineError::NoUsableOutput`].
    pub async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> EngineResult<EscalationOutcome> {
        if !task.estimated_units.is_finite() || task.estimated_units < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "estimated_units must be a non-negative number, got {}",
                task.estimated_units
            )));
        }
        let span = otel::task_span(&task.id, self.tiers.len());
        self.run(task, &cancel).instrument(span.clone()).await.map(|outcome| {
            otel::record_task_result(
                &span,
                outcome.status,
                outcome.trace.tiers.len(),
                outcome.trace.total_cost,
                outcome.trace.total_duration_ms,
            );
            outcome
        })
    }

    async fn run(&self, task: &Task, cancel: &CancellationToken) -> EngineResult<EscalationOutcome> {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut budget = Budget::new(self.config.max_cost, self.config.auto_approve_under);
        let mut records: Vec<TierRecord> = Vec::with_capacity(self.tiers.len());
        let mut escalations = Vec::new();
        let mut stop_reason = None;
        let mut status = FinalStatus::ExhaustedAllTiers;

        for (idx, tier) in self.tiers.iter().enumerate() {
            if cancel.is_cancelled() {
                status = FinalStatus::Cancelled;
                stop_reason = Some(StopReason::Cancelled);
                break;
            }

            let estimate = tier.unit_price * task.estimated_units;
            if !budget.can_afford(estimate) {
                info!(
                    task_id = %task.id,
                    tier = %tier.name,
                    spent = budget.spent,
                    estimate,
                    "budget would be exceeded, stopping"
                );
                status = FinalStatus::BudgetExhausted;
                stop_reason = Some(StopReason::BudgetExceeded {
                    tier: tier.name.clone(),
                    spent: budget.spent,
                    estimate,
                    max_cost: budget.max_cost.unwrap_or_default(),
                });
                break;
            }

            if let Some(previous) = records.last() {
                let auto_approved = !budget.needs_approval();
                if !auto_approved {
                    let request = ApprovalRequest {
                        task_id: task.id.clone(),
                        from_tier: previous.tier.clone(),
                        to_tier: tier.name.clone(),
                        spent_so_far: budget.spent,
                        next_tier_estimate: estimate,
                        max_cost: budget.max_cost,
                    };
                    let approved = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        approved = self.approval.approve(&request) => Some(approved),
                    };
                    let Some(approved) = approved else {
                        warn!(task_id = %task.id, tier = %tier.name, "cancelled awaiting approval");
                        status = FinalStatus::Cancelled;
                        stop_reason = Some(StopReason::Cancelled);
                        break;
                    };
                    if !approved {
                        info!(
                            task_id = %task.id,
                            tier = %tier.name,
                            spent = budget.spent,
                            "escalation not approved, stopping"
                        );
                        status = FinalStatus::BudgetExhausted;
                        stop_reason = Some(StopReason::ApprovalDenied {
                            tier: tier.name.clone(),
                            spent: budget.spent,
                        });
                        break;
                    }
                }
                let reason = escalation_reason(previous);
                let reason_text = reason.to_string();
                let _decision = otel::escalation_span(
                    &task.id,
                    &previous.tier,
                    &tier.name,
                    &reason_text,
                    auto_approved,
                )
                .entered();
                info!(
                    task_id = %task.id,
                    from = %previous.tier,
                    to = %tier.name,
                    reason = %reason_text,
                    auto_approved,
                    "escalating"
                );
                escalations.push(EscalationRecord {
                    from_tier: previous.tier.clone(),
                    to_tier: tier.name.clone(),
                    reason,
                    auto_approved,
                    spent_so_far: budget.spent,
                    timestamp: Utc::now(),
                });
            }

            let (record, cancelled) = self
                .run_tier(idx, tier, task, cancel, estimate, &mut budget)
                .await;
            let meets = record.cqs.meets_threshold;
            records.push(record);

            if cancelled {
                warn!(task_id = %task.id, tier = %tier.name, "task cancelled");
                status = FinalStatus::Cancelled;
                stop_reason = Some(StopReason::Cancelled);
                break;
            }
            if meets {
                status = FinalStatus::Satisfied;
                break;
            }
        }

        let selected = match status {
            FinalStatus::Satisfied => records.len().checked_sub(1),
            _ => select_best(&records),
        };

        let trace = EscalationTrace {
            task_id: task.id.clone(),
            started_at,
            tiers: records,
            escalations,
            final_status: status,
            stop_reason,
            selected,
            total_cost: budget.spent,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            task_id = %trace.task_id,
            status = %trace.final_status,
            tiers = trace.tiers.len(),
            total_cost = trace.total_cost,
            duration_ms = trace.total_duration_ms,
            "task finished"
        );
        self.emit(&trace).await;

        let no_usable_output = status != FinalStatus::Cancelled
            && !trace.tiers.is_empty()
            && trace
                .tiers
                .iter()
                .all(|t| t.degraded && !t.result.has_payload());
        if no_usable_output {
            warn!(task_id = %trace.task_id, "no tier produced usable output");
            return Err(EngineError::NoUsableOutput {
                task_id: trace.task_id,
            });
        }

        let chosen = trace.selected_record();
        Ok(EscalationOutcome {
            status,
            result: chosen.map(|r| r.result.clone()),
            cqs: chosen.map(|r| r.cqs.clone()),
            trace,
        })
    }

    async fn run_tier(
        &self,
        idx: usize,
        tier: &PreparedTier,
        task: &Task,
        cancel: &CancellationToken,
        estimate: f64,
        budget: &mut Budget,
    ) -> (TierRecord, bool) {
        let span = otel::tier_span(&task.id, idx, &tier.name, estimate);
        let started = Instant::now();

        let outcome = tier
            .chain
            .execute(task, cancel)
            .instrument(span.clone())
            .await;
        let cost = outcome.total_cost();
        budget.charge(cost);

        let cqs = if outcome.degraded {
            CompositeQualityScore::degraded(tier.assessor.threshold())
        } else {
            tier.assessor.score(&outcome.result)
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        otel::record_tier_result(&span, &cqs, cost, outcome.degraded, duration_ms);
        debug!(
            task_id = %task.id,
            tier = %tier.name,
            backend = outcome.served_by.as_deref().unwrap_or("none"),
            level = %outcome.level,
            %cqs,
            cost,
            "tier scored"
        );

        let record = TierRecord {
            tier_index: idx,
            tier: tier.name.clone(),
            backend_id: outcome.served_by,
            attempts: outcome.attempts,
            cqs,
            result: outcome.result,
            cost,
            estimated_cost: estimate,
            spent_after: budget.spent,
            level: outcome.level,
            degraded: outcome.degraded,
            warnings: outcome.warnings,
            duration_ms,
        };
        (record, outcome.cancelled)
    }

    /// Hand the trace to every recorder on the blocking pool; sinks may do
    /// file I/O.
    async fn emit(&self, trace: &EscalationTrace) {
        if self.telemetry.is_empty() {
            return;
        }
        let recorders = self.telemetry.clone();
        let owned = trace.clone();
        let written = tokio::task::spawn_blocking(move || {
            recorders
                .iter()
                .filter_map(|recorder| recorder.record(&owned).err())
                .collect::<Vec<_>>()
        })
        .await;
        match written {
            Ok(errors) => {
                for e in errors {
                    warn!(task_id = %trace.task_id, error = %e, "failed to record trace");
                }
            }
            Err(e) => warn!(task_id = %trace.task_id, error = %e, "telemetry task failed"),
        }
    }
}

fn escalation_reason(previous: &TierRecord) -> EscalationReason {
    if previous.degraded {
        EscalationReason::TierUnavailable
    } else {
        EscalationReason::LowQuality {
            score: previous.cqs.score,
            threshold: previous.cqs.threshold,
            failed_gates: previous.cqs.failed_gates.clone(),
        }
    }
}

/// Best result across the tiers that ran: real output over degraded,
/// then highest score, then lowest cost, then earliest tier.
fn select_best(records: &[TierRecord]) -> Option<usize> {
    let served = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.degraded)
        .fold(None::<(usize, &TierRecord)>, |best, (i, r)| match best {
            None => Some((i, r)),
            Some((_, b)) if r.cqs.score > b.cqs.score => Some((i, r)),
            Some((_, b)) if r.cqs.score == b.cqs.score && r.cost < b.cost => Some((i, r)),
            keep => keep,
        })
        .map(|(i, _)| i);

    served.or_else(|| records.iter().position(|r| r.result.has_payload()))
}
