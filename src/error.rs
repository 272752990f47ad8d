//! Error types for the prediction and backtest pipeline.

use thiserror::Error;

/// Pipeline errors.
///
/// Race-level variants are caught by the runner and turned into skipped
/// races. Configuration-level variants fail fast before any computation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Feature shape mismatch in race {race}: {reason}")]
    FeatureShape { race: String, reason: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Leakage: training window ends in {train_end} but test year is {test_year}")]
    LeakageViolation { train_end: i32, test_year: i32 },

    #[error("Invalid training window: {0}")]
    InvalidWindow(String),

    #[error("Invalid policy configuration: {0}")]
    InvalidPolicy(String),

    #[error("Data error: {0}")]
    Data(String),
}

impl PipelineError {
    pub fn feature_shape(race: impl ToString, reason: impl Into<String>) -> Self {
        PipelineError::FeatureShape {
            race: race.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error only affects a single race.
    pub fn is_race_level(&self) -> bool {
        matches!(self, PipelineError::FeatureShape { .. } | PipelineError::Model(_))
    }
}
