use serde::{Deserialize, Serialize};

use crate::models::Strategy;

/// What the oracle said, or why it could not say anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OracleOutcome {
    Verdict {
        classification: Strategy,
        /// 0-100
        confidence: f32,
        reasoning: String,
    },
    Unavailable {
        reason: String,
    },
}

/// Routing decision for one intake file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub strategy: Strategy,
    /// Always within [0, 1].
    pub confidence: f32,
    /// Ordered rationale trail, oldest first.
    pub reasons: Vec<String>,
    pub single_score: u32,
    pub batch_score: u32,
    /// Clockwise degrees that make the page upright, when a rotation trial ran.
    pub rotation_angle: Option<u16>,
    pub oracle: Option<OracleOutcome>,
}

impl ClassificationResult {
    /// Fallback verdict when analysis itself could not run.
    /// Batch scan is the recoverable default.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::BatchScan,
            confidence: 0.0,
            reasons: vec![format!("Classification failed: {}", reason.into())],
            single_score: 0,
            batch_score: 0,
            rotation_angle: None,
            oracle: None,
        }
    }

    /// Force a strategy and record why, keeping the existing trail.
    pub fn override_strategy(&mut self, strategy: Strategy, reason: impl Into<String>) {
        self.strategy = strategy;
        self.reasons.push(reason.into());
    }
}
