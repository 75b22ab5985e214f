//! Telemetry sinks for escalation traces.
//!
//! One [`EscalationTrace`] is emitted per task. Two sinks ship with the
//! crate:
//! - [`JsonlTelemetry`]: append-only JSON-lines file, one trace per line
//! - [`MemoryTelemetry`]: in-process buffer, for tests and embedding

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::escalation::EscalationTrace;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize trace: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives the final trace of every task.
///
/// Failures are reported to the caller, which logs them; a telemetry
/// failure never changes the task's outcome.
pub trait TelemetryRecorder: Send + Sync {
    fn record(&self, trace: &EscalationTrace) -> Result<(), TelemetryError>;
}

/// Appends traces to a JSON-lines file.
#[derive(Debug)]
pub struct JsonlTelemetry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every trace in the file, skipping lines that fail to parse.
    pub fn read_all(&self) -> Result<Vec<EscalationTrace>, TelemetryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

impl TelemetryRecorder for JsonlTelemetry {
    fn record(&self, trace: &EscalationTrace) -> Result<(), TelemetryError> {
        let line = serde_json::to_string(trace)?;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        debug!(path = %self.path.display(), task_id = %trace.task_id, "trace appended");
        Ok(())
    }
}

/// Keeps traces in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    traces: Mutex<Vec<EscalationTrace>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<EscalationTrace> {
        self.traces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.traces.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetryRecorder for MemoryTelemetry {
    fn record(&self, trace: &EscalationTrace) -> Result<(), TelemetryError> {
        self.traces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(trace.clone());
        Ok(())
    }
}
