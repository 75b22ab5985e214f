//! Composite Quality Score (CQS) computation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::signal::{
    validate_signals, BackendSucceeded, JsonFlag, JsonNumber, JsonPresent, JsonRatio,
    QualitySignal, SignalExtractor, SignalSource, SignalSpec, SignalValue,
};
use crate::backend::BackendResult;
use crate::error::ConfigError;

/// Weighted aggregate of a tier result's quality signals.
///
/// Computed fresh per tier attempt and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeQualityScore {
    /// Normalized score in `[0, 1]`.
    pub score: f64,
    pub meets_threshold: bool,
    pub threshold: f64,
    /// Signals that were computed, in configuration order.
    pub signals: Vec<QualitySignal>,
    /// Signals that could not be computed and were left out of the mean.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_gates: Vec<String>,
}

impl CompositeQualityScore {
    /// Score for a degraded tier result: zero, never meets the threshold.
    pub fn degraded(threshold: f64) -> Self {
        Self {
            score: 0.0,
            meets_threshold: false,
            threshold,
            signals: Vec::new(),
            skipped: Vec::new(),
            failed_gates: Vec::new(),
        }
    }

    pub fn signal(&self, name: &str) -> Option<SignalValue> {
        self.signals.iter().find(|s| s.name == name).map(|s| s.value)
    }
}

impl fmt::Display for CompositeQualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cqs={:.3} threshold={:.3} {}",
            self.score,
            self.threshold,
            if self.meets_threshold { "PASS" } else { "FAIL" }
        )?;
        if !self.failed_gates.is_empty() {
            write!(f, " failed_gates=[{}]", self.failed_gates.join(","))?;
        }
        if !self.skipped.is_empty() {
            write!(f, " skipped=[{}]", self.skipped.join(","))?;
        }
        Ok(())
    }
}

struct ResolvedSignal {
    spec: SignalSpec,
    extractor: Arc<dyn SignalExtractor>,
}

/// Scores backend results against one tier's signal configuration.
///
/// Stateless after construction: scoring the same result twice yields the
/// same [`CompositeQualityScore`].
pub struct QualityAssessor {
    signals: Vec<ResolvedSignal>,
    threshold: f64,
}

impl fmt::Debug for QualityAssessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityAssessor")
            .field("signals", &self.signals.iter().map(|s| &s.spec.name).collect::<Vec<_>>())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl QualityAssessor {
    /// Build an assessor with only the built-in extractors.
    pub fn new(specs: Vec<SignalSpec>, threshold: f64) -> Result<Self, ConfigError> {
        Self::with_extractors(specs, threshold, &HashMap::new())
    }

    /// Build an assessor, resolving `custom` sources against `extractors`.
    pub fn with_extractors(
        specs: Vec<SignalSpec>,
        threshold: f64,
        extractors: &HashMap<String, Arc<dyn SignalExtractor>>,
    ) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::validation(
                "quality_threshold",
                format!("must be within [0, 1], got {threshold}"),
            ));
        }
        validate_signals(&specs)?;

        let signals = specs
            .into_iter()
            .map(|spec| {
                let extractor = resolve(&spec, extractors)?;
                Ok(ResolvedSignal { spec, extractor })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self { signals, threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compute the CQS for `result`.
    ///
    /// Numeric signals form a weighted mean; uncomputable ones are skipped
    /// rather than counted as zero, as are non-finite numbers and values of
    /// the wrong shape for their source. Any false gate fails the threshold. A
    /// tier with no weighted signals scores 1.0 when every gate passes.
    pub fn score(&self, result: &BackendResult) -> CompositeQualityScore {
        let mut signals = Vec::with_capacity(self.signals.len());
        let mut skipped = Vec::new();
        let mut failed_gates = Vec::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut weighted_configured = false;

        for resolved in &self.signals {
            let spec = &resolved.spec;
            if !spec.is_gate() {
                weighted_configured = true;
            }
            let Some(raw) = resolved.extractor.extract(result) else {
                skipped.push(spec.name.clone());
                continue;
            };
            // a gate must yield a flag, a weighted signal a finite number
            let value = match (spec.is_gate(), raw) {
                (true, SignalValue::Flag(passed)) => {
                    if !passed {
                        failed_gates.push(spec.name.clone());
                    }
                    raw
                }
                (false, SignalValue::Number(n)) if n.is_finite() => {
                    let n = n.clamp(0.0, 1.0);
                    weighted_sum += spec.weight * n;
                    weight_total += spec.weight;
                    SignalValue::Number(n)
                }
                (gate, value) => {
                    debug!(signal = %spec.name, gate, ?value, "unusable signal value, skipping");
                    skipped.push(spec.name.clone());
                    continue;
                }
            };
            signals.push(QualitySignal {
                name: spec.name.clone(),
                value,
            });
        }

        let gates_pass = failed_gates.is_empty();
        let (score, computable) = if weight_total > 0.0 {
            ((weighted_sum / weight_total).clamp(0.0, 1.0), true)
        } else if weighted_configured {
            (0.0, false)
        } else if gates_pass {
            (1.0, true)
        } else {
            (0.0, true)
        };

        CompositeQualityScore {
            score,
            meets_threshold: computable && gates_pass && score >= self.threshold,
            threshold: self.threshold,
            signals,
            skipped,
            failed_gates,
        }
    }
}

fn resolve(
    spec: &SignalSpec,
    extractors: &HashMap<String, Arc<dyn SignalExtractor>>,
) -> Result<Arc<dyn SignalExtractor>, ConfigError> {
    let extractor: Arc<dyn SignalExtractor> = match &spec.source {
        SignalSource::Numeric { pointer } => Arc::new(JsonNumber {
            pointer: pointer.clone(),
        }),
        SignalSource::Ratio {
            numerator,
            denominator,
        } => Arc::new(JsonRatio {
            numerator: numerator.clone(),
            denominator: denominator.clone(),
        }),
        SignalSource::Boolean { pointer } => Arc::new(JsonFlag {
            pointer: pointer.clone(),
        }),
        SignalSource::Present { pointer } => Arc::new(JsonPresent {
            pointer: pointer.clone(),
        }),
        SignalSource::BackendSuccess => Arc::new(BackendSucceeded),
        SignalSource::Custom { extractor, .. } => {
            extractors.get(extractor).cloned().ok_or_else(|| {
                ConfigError::validation(
                    format!("signals.{}.source", spec.name),
                    format!("no extractor registered as '{extractor}'"),
                )
            })?
        }
    };
    Ok(extractor)
}
