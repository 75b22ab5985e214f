//! Runner configuration: the escalation ladder plus concrete endpoints.
//!
//! One TOML file holds both. The escalation part (`tiers`, `max_cost`,
//! `retry`, ...) is read by the library; the `[[endpoints]]` tables tell the
//! runner how to reach each backend id the tiers reference.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use coordination::{Backend, BackendError, BackendResult, EscalationConfig, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http_backend::HttpBackend;
use crate::static_backend::StaticBackend;

#[derive(Debug, Error, PartialEq)]
pub enum EndpointError {
    #[error("endpoint `{0}` is defined more than once")]
    Duplicate(String),
    #[error("tier `{tier}` references backend `{backend}` but no endpoint defines it")]
    Missing { tier: String, backend: String },
    #[error("endpoint `{id}` reads its API key from `{var}`, which is not set")]
    MissingApiKey { id: String, var: String },
}

/// How to reach one backend id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// JSON-over-HTTP service.
    Http {
        id: String,
        url: String,
        /// Environment variable holding a bearer token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
        /// Charged when the response does not report its own cost.
        #[serde(default)]
        cost_per_call: f64,
    },
    /// Canned answer, handy for dry runs and local testing.
    Static {
        id: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        cost: f64,
        /// Fail every call with this kind instead of answering.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorKind>,
    },
}

impl EndpointConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Http { id, .. } | Self::Static { id, .. } => id,
        }
    }

    /// Build the backend this entry describes.
    pub fn build(&self) -> Result<Arc<dyn Backend>> {
        match self {
            Self::Http {
                id,
                url,
                api_key_env,
                cost_per_call,
            } => {
                let api_key = match api_key_env {
                    Some(var) => Some(std::env::var(var).map_err(|_| {
                        EndpointError::MissingApiKey {
                            id: id.clone(),
                            var: var.clone(),
                        }
                    })?),
                    None => None,
                };
                let backend = HttpBackend::new(id.clone(), url.clone(), api_key)
                    .with_context(|| format!("Failed to build HTTP client for `{id}`"))?
                    .with_cost_per_call(*cost_per_call);
                Ok(Arc::new(backend))
            }
            Self::Static {
                id,
                payload,
                cost,
                error,
            } => {
                let reply = match error {
                    Some(kind) => Err(BackendError::new(*kind, format!("static endpoint `{id}`"))),
                    None => Ok(BackendResult::ok(payload.clone(), *cost)),
                };
                Ok(Arc::new(StaticBackend::new(id.clone(), reply)))
            }
        }
    }
}

/// Everything the runner reads from its TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(flatten)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl RunnerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse runner config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Escalation rules first, then endpoint coverage of every referenced id.
    pub fn validate(&self) -> Result<()> {
        self.escalation.validate()?;

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.id()) {
                return Err(EndpointError::Duplicate(endpoint.id().to_string()).into());
            }
        }
        for tier in &self.escalation.tiers {
            for backend in &tier.backends {
                if !seen.contains(backend.id.as_str()) {
                    return Err(EndpointError::Missing {
                        tier: tier.name.clone(),
                        backend: backend.id.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn build_backends(&self) -> Result<Vec<Arc<dyn Backend>>> {
        self.endpoints.iter().map(EndpointConfig::build).collect()
    }
}
