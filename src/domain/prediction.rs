//! Prediction results and advisory confidence/risk thresholds.
//!
//! Thresholds annotate a result's explanation; they never remove the result
//! or change its numbers. Callers that need hard exclusion should check
//! [`PredictionResult::is_flagged`] themselves.

use serde::{Deserialize, Serialize};

/// Output of the external model, as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Model certainty in `[0, 1]`
    pub confidence: f64,
    /// Always `1 - confidence`
    pub risk: f64,
    /// Free-text explanation, possibly with threshold notes appended
    pub explanation: String,
    #[serde(default)]
    flagged: bool,
}

impl PredictionResult {
    /// Create a result, clamping confidence into `[0, 1]`.
    ///
    /// A NaN confidence is treated as zero.
    pub fn new(confidence: f64, explanation: impl Into<String>) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            confidence,
            risk: 1.0 - confidence,
            explanation: explanation.into(),
            flagged: false,
        }
    }

    /// Check if any threshold note has been appended.
    pub fn is_flagged(&self) -> bool {
        self.flagged
    }

    fn append_note(&mut self, note: &str) {
        if !self.explanation.is_empty() {
            self.explanation.push(' ');
        }
        self.explanation.push_str(note);
        self.flagged = true;
    }
}

/// Advisory confidence and risk thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdFilter {
    /// Minimum acceptable confidence
    #[serde(default)]
    pub min_confidence: Option<f64>,
    /// Maximum acceptable risk
    #[serde(default)]
    pub max_risk: Option<f64>,
}

impl ThresholdFilter {
    /// Create a filter from optional thresholds.
    pub fn new(min_confidence: Option<f64>, max_risk: Option<f64>) -> Self {
        Self {
            min_confidence,
            max_risk,
        }
    }

    /// Overlay `other` on top of `self`: any threshold set in `other` wins.
    pub fn merged_with(&self, other: &ThresholdFilter) -> ThresholdFilter {
        ThresholdFilter {
            min_confidence: other.min_confidence.or(self.min_confidence),
            max_risk: other.max_risk.or(self.max_risk),
        }
    }

    /// Check if neither threshold is set.
    pub fn is_empty(&self) -> bool {
        self.min_confidence.is_none() && self.max_risk.is_none()
    }

    /// Apply both thresholds independently and return the annotated result.
    ///
    /// `confidence` and `risk` are passed through untouched.
    pub fn apply(&self, mut result: PredictionResult) -> PredictionResult {
        if let Some(min_confidence) = self.min_confidence {
            if result.confidence < min_confidence {
                let note = format!(
                    "[Filtered out: confidence {:.3} is below the minimum of {:.3}]",
                    result.confidence, min_confidence
                );
                result.append_note(&note);
            }
        }

        if let Some(max_risk) = self.max_risk {
            if result.risk > max_risk {
                let note = format!(
                    "[Filtered out: risk {:.3} exceeds the maximum of {:.3}]",
                    result.risk, max_risk
                );
                result.append_note(&note);
            }
        }

        result
    }
}
