//! Backend collaborator interface.
//!
//! A backend performs the actual work for a task (a remote model call, a
//! local tool run, ...). The engine only sees the [`Backend`] trait: a
//! typed result or a typed error, never a string to pattern-match.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, ErrorKind};

/// A unit of work submitted to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Caller-visible identifier, echoed in the escalation trace.
    pub id: String,
    /// Opaque input handed to every backend unchanged.
    pub payload: serde_json::Value,
    /// Work size used with each tier's `unit_price` to estimate cost.
    #[serde(default = "default_units")]
    pub estimated_units: f64,
}

fn default_units() -> f64 {
    1.0
}

impl Task {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
            estimated_units: default_units(),
        }
    }

    /// Task with a generated id.
    pub fn anonymous(payload: serde_json::Value) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_units(mut self, units: f64) -> Self {
        self.estimated_units = units;
        self
    }
}

/// Output of a single backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    pub payload: serde_json::Value,
    /// Actual cost charged for the call.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub latency_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BackendError>,
}

impl BackendResult {
    pub fn ok(payload: serde_json::Value, cost: f64) -> Self {
        Self {
            payload,
            cost,
            latency_ms: 0,
            success: true,
            error: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }

    /// Synthetic result used when every backend of a chain failed.
    pub fn degraded(payload: serde_json::Value) -> Self {
        Self {
            payload,
            cost: 0.0,
            latency_ms: 0,
            success: false,
            error: None,
        }
    }

    /// Turn a `success = false` result into the error it reports.
    ///
    /// Backends that answer with an unsuccessful result but no error are
    /// treated as a server-side failure.
    pub fn into_outcome(self) -> Result<BackendResult, BackendError> {
        if self.success {
            return Ok(self);
        }
        Err(self.error.unwrap_or_else(|| {
            BackendError::new(
                ErrorKind::ServerError,
                "backend reported failure without an error",
            )
        }))
    }

    /// Whether the payload carries anything at all.
    pub fn has_payload(&self) -> bool {
        match &self.payload {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::Object(o) => !o.is_empty(),
            _ => true,
        }
    }
}

/// An execution backend: one provider/model/tool that can run a task.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identifier, e.g. `"openai:gpt-4o-mini"`.
    fn id(&self) -> &str;

    /// Run the task. Implementations should honour `timeout` themselves when
    /// they can; the retry executor also enforces it from the outside.
    async fn call(&self, task: &Task, timeout: Duration) -> Result<BackendResult, BackendError>;
}
