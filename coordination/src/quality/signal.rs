//! Quality signals and the extractors that compute them.
//!
//! A signal is either a number in `[0, 1]`, which feeds the weighted mean,
//! or a flag, which acts as a hard gate. Extractors return `None` when a
//! signal cannot be computed for a given result.

use serde::{Deserialize, Serialize};

use crate::backend::BackendResult;
use crate::error::ConfigError;

/// Value of one computed signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Flag(bool),
}

/// A named measurement contributing to the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySignal {
    pub name: String,
    pub value: SignalValue,
}

/// Computes one signal from a backend result.
pub trait SignalExtractor: Send + Sync {
    fn extract(&self, result: &BackendResult) -> Option<SignalValue>;
}

/// Where a configured signal reads its value from.
///
/// Pointers are RFC 6901 JSON pointers into the result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalSource {
    /// Number at `pointer`, clamped to `[0, 1]`.
    Numeric { pointer: String },
    /// `numerator / denominator`; skipped when the denominator is 0 or missing.
    Ratio {
        numerator: String,
        denominator: String,
    },
    /// Gate: boolean at `pointer`.
    Boolean { pointer: String },
    /// Gate: `pointer` exists and is non-empty.
    Present { pointer: String },
    /// Gate: the backend reported success.
    BackendSuccess,
    /// Extractor registered on the assessor under `extractor`.
    Custom {
        extractor: String,
        #[serde(default)]
        gate: bool,
    },
}

impl SignalSource {
    pub fn is_gate(&self) -> bool {
        match self {
            Self::Numeric { .. } | Self::Ratio { .. } => false,
            Self::Boolean { .. } | Self::Present { .. } | Self::BackendSuccess => true,
            Self::Custom { gate, .. } => *gate,
        }
    }

    fn pointers(&self) -> Vec<&str> {
        match self {
            Self::Numeric { pointer } | Self::Boolean { pointer } | Self::Present { pointer } => {
                vec![pointer.as_str()]
            }
            Self::Ratio {
                numerator,
                denominator,
            } => vec![numerator.as_str(), denominator.as_str()],
            Self::BackendSuccess | Self::Custom { .. } => Vec::new(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// One configured signal of a tier.
///
/// ```toml
/// [[tiers.signals]]
/// name = "pass_rate"
/// weight = 0.7
/// source = { kind = "numeric", pointer = "/tests/pass_rate" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    /// Weight in the mean. Ignored for gates.
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub source: SignalSource,
}

impl SignalSpec {
    pub fn new(name: impl Into<String>, weight: f64, source: SignalSource) -> Self {
        Self {
            name: name.into(),
            weight,
            source,
        }
    }

    pub fn numeric(name: impl Into<String>, weight: f64, pointer: impl Into<String>) -> Self {
        Self::new(
            name,
            weight,
            SignalSource::Numeric {
                pointer: pointer.into(),
            },
        )
    }

    pub fn gate(name: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self::new(
            name,
            0.0,
            SignalSource::Boolean {
                pointer: pointer.into(),
            },
        )
    }

    pub fn is_gate(&self) -> bool {
        self.source.is_gate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::validation("signals.name", "must not be empty"));
        }
        if !self.is_gate() && (!self.weight.is_finite() || self.weight < 0.0) {
            return Err(ConfigError::validation(
                format!("signals.{}.weight", self.name),
                format!("must be a non-negative number, got {}", self.weight),
            ));
        }
        for pointer in self.source.pointers() {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(ConfigError::validation(
                    format!("signals.{}.source", self.name),
                    format!("JSON pointer must start with '/', got '{pointer}'"),
                ));
            }
        }
        Ok(())
    }
}

/// Validate a tier's signal list: names unique, weights non-negative and
/// summing to more than zero when any weighted signal is configured.
pub fn validate_signals(specs: &[SignalSpec]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::validation(
                "signals.name",
                format!("duplicate signal '{}'", spec.name),
            ));
        }
    }
    let weighted: Vec<&SignalSpec> = specs.iter().filter(|s| !s.is_gate()).collect();
    if !weighted.is_empty() && weighted.iter().map(|s| s.weight).sum::<f64>() <= 0.0 {
        return Err(ConfigError::validation(
            "signals.weight",
            "weights of numeric signals must sum to more than 0",
        ));
    }
    Ok(())
}

// ── Built-in extractors ──────────────────────────────────────────────

fn lookup<'a>(result: &'a BackendResult, pointer: &str) -> Option<&'a serde_json::Value> {
    result.payload.pointer(pointer)
}

fn is_present(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Number at a JSON pointer, clamped to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct JsonNumber {
    pub pointer: String,
}

impl SignalExtractor for JsonNumber {
    fn extract(&self, result: &BackendResult) -> Option<SignalValue> {
        let n = lookup(result, &self.pointer)?.as_f64()?;
        n.is_finite().then(|| SignalValue::Number(n.clamp(0.0, 1.0)))
    }
}

/// Ratio of two numbers in the payload, e.g. `passed / total`.
#[derive(Debug, Clone)]
pub struct JsonRatio {
    pub numerator: String,
    pub denominator: String,
}

impl SignalExtractor for JsonRatio {
    fn extract(&self, result: &BackendResult) -> Option<SignalValue> {
        let num = lookup(result, &self.numerator)?.as_f64()?;
        let den = lookup(result, &self.denominator)?.as_f64()?;
        if den == 0.0 || !num.is_finite() || !den.is_finite() {
            return None;
        }
        Some(SignalValue::Number((num / den).clamp(0.0, 1.0)))
    }
}

/// Boolean at a JSON pointer.
#[derive(Debug, Clone)]
pub struct JsonFlag {
    pub pointer: String,
}

impl SignalExtractor for JsonFlag {
    fn extract(&self, result: &BackendResult) -> Option<SignalValue> {
        lookup(result, &self.pointer)?
            .as_bool()
            .map(SignalValue::Flag)
    }
}

/// Whether a JSON pointer resolves to a non-empty value. Always computable.
#[derive(Debug, Clone)]
pub struct JsonPresent {
    pub pointer: String,
}

impl SignalExtractor for JsonPresent {
    fn extract(&self, result: &BackendResult) -> Option<SignalValue> {
        let present = lookup(result, &self.pointer).is_some_and(is_present);
        Some(SignalValue::Flag(present))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackendSucceeded;

impl SignalExtractor for BackendSucceeded {
    fn extract(&self, result: &BackendResult) -> Option<SignalValue> {
        Some(SignalValue::Flag(result.success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(payload: serde_json::Value) -> BackendResult {
        BackendResult::ok(payload, 0.0)
    }

    #[test]
    fn test_numeric_clamped() {
        let r = result(json!({"score": 1.7, "neg": -2, "text": "x"}));
        let ex = |p: &str| JsonNumber { pointer: p.into() }.extract(&r);
        assert_eq!(ex("/score"), Some(SignalValue::Number(1.0)));
        assert_eq!(ex("/neg"), Some(SignalValue::Number(0.0)));
        assert_eq!(ex("/text"), None);
        assert_eq!(ex("/missing"), None);
    }

    #[test]
    fn test_ratio_skips_zero_denominator() {
        let r = result(json!({"passed": 9, "total": 10, "none": 0}));
        let ratio = JsonRatio {
            numerator: "/passed".into(),
            denominator: "/total".into(),
        };
        assert_eq!(ratio.extract(&r), Some(SignalValue::Number(0.9)));
        let zero = JsonRatio {
            numerator: "/passed".into(),
            denominator: "/none".into(),
        };
        assert_eq!(zero.extract(&r), None);
    }

    #[test]
    fn test_gates() {
        let r = result(json!({"ok": false, "body": "", "list": [1]}));
        assert_eq!(
            JsonFlag { pointer: "/ok".into() }.extract(&r),
            Some(SignalValue::Flag(false))
        );
        assert_eq!(JsonFlag { pointer: "/nope".into() }.extract(&r), None);
        assert_eq!(
            JsonPresent { pointer: "/body".into() }.extract(&r),
            Some(SignalValue::Flag(false))
        );
        assert_eq!(
            JsonPresent { pointer: "/list".into() }.extract(&r),
            Some(SignalValue::Flag(true))
        );
        assert_eq!(BackendSucceeded.extract(&r), Some(SignalValue::Flag(true)));
    }

    #[test]
    fn test_validate_rejects_zero_weights() {
        let specs = vec![
            SignalSpec::numeric("a", 0.0, "/a"),
            SignalSpec::numeric("b", 0.0, "/b"),
        ];
        assert!(validate_signals(&specs).is_err());
    }

    #[test]
    fn test_validate_gate_only_ok() {
        assert!(validate_signals(&[SignalSpec::gate("compiles", "/ok")]).is_ok());
        assert!(validate_signals(&[]).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_pointer() {
        let dup = vec![
            SignalSpec::numeric("a", 1.0, "/a"),
            SignalSpec::numeric("a", 1.0, "/b"),
        ];
        assert!(validate_signals(&dup).is_err());
        assert!(validate_signals(&[SignalSpec::numeric("a", 1.0, "a")]).is_err());
        assert!(validate_signals(&[SignalSpec::numeric("a", -1.0, "/a")]).is_err());
    }

    #[test]
    fn test_source_from_toml() {
        let spec: SignalSpec = toml::from_str(
            r#"
            name = "coverage"
            weight = 0.3
            source = { kind = "ratio", numerator = "/covered", denominator = "/lines" }
            "#,
        )
        .unwrap();
        assert_eq!(spec.weight, 0.3);
        assert!(!spec.is_gate());
        let gate: SignalSpec =
            toml::from_str("name = \"ok\"\nsource = { kind = \"backend_success\" }").unwrap();
        assert!(gate.is_gate());
    }
}
