//! Command-line surface: arguments, one task run, and the printed report.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coordination::otel::SpanSummary;
use coordination::{
    EscalationOutcome, FinalStatus, JsonlTelemetry, StaticApproval, Task,
    TierEscalationOrchestrator,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RunnerConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "tier-runner", about = "Run one task up a ladder of execution tiers")]
pub struct Args {
    /// TOML file with tiers and endpoints.
    #[arg(short, long, default_value = "tiers.toml")]
    pub config: PathBuf,

    /// Task id; generated when omitted.
    #[arg(long)]
    pub task_id: Option<String>,

    /// Task payload as inline JSON.
    #[arg(long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Read the task payload from a JSON file.
    #[arg(long)]
    pub payload_file: Option<PathBuf>,

    /// Work size multiplied by each tier's unit price.
    #[arg(long, default_value_t = 1.0)]
    pub units: f64,

    /// Append-only JSONL file receiving the escalation trace.
    #[arg(long, default_value = ".tier-telemetry.jsonl")]
    pub telemetry: PathBuf,

    /// Approve escalations past the auto-approve threshold.
    #[arg(long)]
    pub approve_escalation: bool,

    /// Fixed seed for retry jitter.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json: bool,
}

impl Args {
    fn payload(&self) -> Result<serde_json::Value> {
        if let Some(inline) = &self.payload {
            return serde_json::from_str(inline).context("--payload is not valid JSON");
        }
        if let Some(path) = &self.payload_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read payload file {}", path.display()))?;
            return serde_json::from_str(&content)
                .with_context(|| format!("Payload file {} is not valid JSON", path.display()));
        }
        Ok(serde_json::json!({}))
    }

    pub fn task(&self) -> Result<Task> {
        let payload = self.payload()?;
        let task = match &self.task_id {
            Some(id) => Task::new(id.clone(), payload),
            None => Task::anonymous(payload),
        };
        Ok(task.with_units(self.units))
    }
}

/// What the runner prints on stdout.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub task_id: String,
    pub status: FinalStatus,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cqs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_by_tier: Option<String>,
    pub payload: serde_json::Value,
    pub summary: SpanSummary,
}

impl RunReport {
    pub fn from_outcome(outcome: &EscalationOutcome) -> Self {
        Self {
            task_id: outcome.trace.task_id.clone(),
            status: outcome.status,
            degraded: outcome.is_degraded(),
            cqs: outcome.cqs.as_ref().map(|c| c.score),
            served_by_tier: outcome.trace.selected_record().map(|r| r.tier.clone()),
            payload: outcome
                .result
                .as_ref()
                .map(|r| r.payload.clone())
                .unwrap_or(serde_json::Value::Null),
            summary: SpanSummary::from_trace(&outcome.trace),
        }
    }

    /// 0 satisfied, 1 best-effort result, 130 cancelled.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            FinalStatus::Satisfied => 0,
            FinalStatus::Cancelled => 130,
            FinalStatus::BudgetExhausted | FinalStatus::ExhaustedAllTiers => 1,
        }
    }
}

/// Load config, build the ladder and run one task.
pub async fn run(args: &Args, cancel: CancellationToken) -> Result<RunReport> {
    let config = RunnerConfig::load(&args.config)?;
    let task = args.task()?;
    let backends = config.build_backends()?;

    let mut builder = TierEscalationOrchestrator::builder(config.escalation.clone())
        .backends(backends)
        .approval(Arc::new(StaticApproval(args.approve_escalation)))
        .telemetry(Arc::new(JsonlTelemetry::new(args.telemetry.clone())));
    if let Some(seed) = args.seed {
        builder = builder.jitter_seed(seed);
    }
    let orchestrator = builder.build().context("Failed to build orchestrator")?;

    info!(
        task_id = %task.id,
        tiers = ?orchestrator.tier_names(),
        config = %args.config.display(),
        "Tier runner starting"
    );

    let outcome = orchestrator
        .execute(&task, cancel)
        .await
        .with_context(|| format!("Task {} produced no usable output", task.id))?;

    info!(trace = %outcome.trace, "Task finished");
    Ok(RunReport::from_outcome(&outcome))
}
