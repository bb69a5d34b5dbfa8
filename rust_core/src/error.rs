//! Error taxonomy for the core pipeline.
//!
//! Fatal and non-fatal conditions share one enum; callers decide severity
//! through the helpers below rather than by matching on message text.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Stored posterior could not be parsed or failed structural validation.
    #[error("invalid posterior format for team {team_id}: {reason}")]
    InvalidPosteriorFormat { team_id: String, reason: String },

    /// Attempted write to frozen encoder weights.
    #[error("frozen encoder violation: {0}")]
    FrozenEncoderViolation(String),

    #[error("insufficient training data: {0}")]
    InsufficientTrainingData(String),

    #[error("season transition failed for team {team_id}: {reason}")]
    SeasonTransitionFailure { team_id: String, reason: String },

    #[error(
        "simulation divergence: win probability {first:.4} vs {second:.4} (tolerance {tolerance:.4})"
    )]
    SimulationDivergence {
        first: f64,
        second: f64,
        tolerance: f64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid outcome label: {0}")]
    InvalidLabel(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        CoreError::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Conditions that are logged and skipped instead of aborting the caller.
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidPosteriorFormat { .. }
                | CoreError::SeasonTransitionFailure { .. }
                | CoreError::SimulationDivergence { .. }
        )
    }

    /// Storage failures that are likely to succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Storage(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("broken pipe")
                    || msg.contains("could not serialize")
                    || msg.contains("deadlock detected")
                    || msg.contains("too many clients")
                    || msg.contains("pool")
            }
            CoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::Storage("connection refused".into()).is_transient());
        assert!(CoreError::Storage("deadlock detected".into()).is_transient());
        assert!(!CoreError::Storage("unique constraint violation".into()).is_transient());
        assert!(!CoreError::FrozenEncoderViolation("write".into()).is_transient());
    }

    #[test]
    fn test_non_fatal_classification() {
        let err = CoreError::SeasonTransitionFailure {
            team_id: "DUKE".into(),
            reason: "bad season".into(),
        };
        assert!(err.is_non_fatal());
        assert!(!CoreError::InsufficientTrainingData("empty".into()).is_non_fatal());
    }
}
