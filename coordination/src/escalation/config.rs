//! Escalation configuration, loaded once and validated before any task runs.
//!
//! ```toml
//! max_cost = 1.00
//! auto_approve_under = 0.50
//!
//! [retry]                 # defaults for every backend
//! max_attempts = 3
//!
//! [[tiers]]
//! name = "cheap"
//! unit_price = 0.30
//! quality_threshold = 0.9
//!
//! [[tiers.backends]]
//! id = "openai:gpt-4o-mini"
//!
//! [[tiers.backends]]
//! id = "groq:llama-3-8b"
//! retry = { max_attempts = 2 }
//!
//! [[tiers.signals]]
//! name = "pass_rate"
//! weight = 1.0
//! source = { kind = "numeric", pointer = "/pass_rate" }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::quality::{validate_signals, SignalSpec};
use crate::resilience::{CircuitBreakerConfig, ResourceKey, RetryConfig};

/// One backend slot in a tier's fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRef {
    /// Identifier of a registered backend.
    pub id: String,
    /// Breaker scope; defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl BackendRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_key: None,
            retry: None,
            circuit_breaker: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_key.as_deref().unwrap_or(&self.id))
    }
}

fn default_threshold() -> f64 {
    0.8
}

/// One rung of the escalation ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// Tried in order; the first success wins.
    pub backends: Vec<BackendRef>,
    #[serde(default = "default_threshold")]
    pub quality_threshold: f64,
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
    /// Price per task unit, multiplied by `Task::estimated_units` to
    /// estimate the tier's cost before running it.
    #[serde(default)]
    pub unit_price: f64,
    /// Payload returned, marked degraded, when every backend fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_default: Option<serde_json::Value>,
}

impl TierConfig {
    pub fn new(name: impl Into<String>, backends: Vec<BackendRef>) -> Self {
        Self {
            name: name.into(),
            backends,
            quality_threshold: default_threshold(),
            signals: Vec::new(),
            unit_price: 0.0,
            terminal_default: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn with_signals(mut self, signals: Vec<SignalSpec>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_unit_price(mut self, price: f64) -> Self {
        self.unit_price = price;
        self
    }

    pub fn with_terminal_default(mut self, payload: serde_json::Value) -> Self {
        self.terminal_default = Some(payload);
        self
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let field = |name: &str| format!("tiers[{index}].{name}");
        if self.name.trim().is_empty() {
            return Err(ConfigError::validation(field("name"), "must not be empty"));
        }
        if self.backends.is_empty() {
            return Err(ConfigError::validation(
                field("backends"),
                "at least one backend is required",
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ConfigError::validation(
                field("quality_threshold"),
                format!("must be within [0, 1], got {}", self.quality_threshold),
            ));
        }
        if !self.unit_price.is_finite() || self.unit_price < 0.0 {
            return Err(ConfigError::validation(
                field("unit_price"),
                "must be a non-negative number",
            ));
        }
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(ConfigError::validation(field("backends.id"), "must not be empty"));
            }
            if let Some(retry) = &backend.retry {
                retry.validate()?;
            }
            if let Some(cb) = &backend.circuit_breaker {
                cb.validate()?;
            }
        }
        validate_signals(&self.signals)
    }
}

/// Full escalation setup for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Ordered cheapest first.
    pub tiers: Vec<TierConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Escalation proceeds without approval while spend is below this.
    /// Unset means always auto-approve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_under: Option<f64>,
    /// Applied to backends without their own `retry` table.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Applied to backends without their own `circuit_breaker` table.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl EscalationConfig {
    pub fn new(tiers: Vec<TierConfig>) -> Self {
        Self {
            tiers,
            max_cost: None,
            auto_approve_under: None,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn with_auto_approve_under(mut self, threshold: f64) -> Self {
        self.auto_approve_under = Some(threshold);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Retry settings in effect for `backend`.
    pub fn retry_for(&self, backend: &BackendRef) -> RetryConfig {
        backend.retry.clone().unwrap_or_else(|| self.retry.clone())
    }

    /// Breaker settings in effect for `backend`.
    pub fn breaker_for(&self, backend: &BackendRef) -> CircuitBreakerConfig {
        backend
            .circuit_breaker
            .clone()
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::validation("tiers", "at least one tier is required"));
        }
        for (field, value) in [
            ("max_cost", self.max_cost),
            ("auto_approve_under", self.auto_approve_under),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(ConfigError::validation(
                        field,
                        format!("must be a non-negative number, got {v}"),
                    ));
                }
            }
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        for (index, tier) in self.tiers.iter().enumerate() {
            tier.validate(index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
max_cost = 1.0
auto_approve_under = 0.5

[retry]
max_attempts = 2
initial_delay_ms = 50

[[tiers]]
name = "cheap"
unit_price = 0.3
quality_threshold = 0.9

[[tiers.backends]]
id = "local:small"

[[tiers.backends]]
id = "cloud:mini"
resource_key = "cloud"
retry = { max_attempts = 4 }

[[tiers.signals]]
name = "pass_rate"
source = { kind = "numeric", pointer = "/pass_rate" }

[[tiers]]
name = "premium"
unit_price = 0.9
terminal_default = { answer = "unavailable" }

[[tiers.backends]]
id = "cloud:large"
circuit_breaker = { failure_threshold = 2 }
"#;

    #[test]
    fn test_parse_sample() {
        let config = EscalationConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.tiers.len(), 2);
        assert_eq!(config.max_cost, Some(1.0));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.backoff_factor, 2.0);

        let cheap = &config.tiers[0];
        assert_eq!(cheap.backends[0].key().as_str(), "local:small");
        assert_eq!(cheap.backends[1].key().as_str(), "cloud");
        assert_eq!(config.retry_for(&cheap.backends[0]).max_attempts, 2);
        assert_eq!(config.retry_for(&cheap.backends[1]).max_attempts, 4);
        assert_eq!(cheap.signals[0].weight, 1.0);

        let premium = &config.tiers[1];
        assert_eq!(premium.quality_threshold, 0.8);
        assert_eq!(config.breaker_for(&premium.backends[0]).failure_threshold, 2);
        assert!(premium.terminal_default.is_some());
    }

    #[test]
    fn test_rejects_empty_tiers() {
        let err = EscalationConfig::from_toml_str("tiers = []").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "tiers"));
    }

    #[test]
    fn test_rejects_tier_without_backends() {
        let config = EscalationConfig::new(vec![TierConfig::new("t", Vec::new())]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_backoff_factor() {
        let toml = r#"
[[tiers]]
name = "t"
[[tiers.backends]]
id = "a"
retry = { backoff_factor = 1.0 }
"#;
        let err = EscalationConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "backoff_factor"));
    }

    #[test]
    fn test_rejects_zero_failure_threshold() {
        let config = EscalationConfig::new(vec![TierConfig::new("t", vec![BackendRef::new("a")])])
            .with_circuit_breaker(CircuitBreakerConfig::new(0, std::time::Duration::from_secs(1)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let tier = TierConfig::new("t", vec![BackendRef::new("a")]);
        assert!(EscalationConfig::new(vec![tier.clone().with_threshold(1.2)])
            .validate()
            .is_err());
        assert!(EscalationConfig::new(vec![tier.clone().with_unit_price(-1.0)])
            .validate()
            .is_err());
        assert!(EscalationConfig::new(vec![tier]).with_max_cost(-0.01).validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            EscalationConfig::from_toml_str("tiers = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = EscalationConfig::load(file.path()).unwrap();
        assert_eq!(config.tiers[1].name, "premium");

        assert!(matches!(
            EscalationConfig::load("/nonexistent/escalation.toml"),
            Err(ConfigError::NotFound(_))
        ));
    }
}
