//! Environment loading for the game processor.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

/// Default directory holding model weight documents
pub const DEFAULT_WEIGHTS_DIR: &str = "./models";

/// Default number of unprocessed games handled per session
pub const DEFAULT_BATCH_LIMIT: usize = 500;

/// Default prediction window, in days from today
pub const DEFAULT_PREDICT_DAYS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Update posteriors from completed games
    Process,
    /// Price upcoming games
    Predict,
}

impl Mode {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "process" => Ok(Mode::Process),
            "predict" => Ok(Mode::Predict),
            other => bail!("Unknown MODE {other:?}; expected process or predict"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub mode: Mode,
    pub database_url: String,
    pub weights_dir: PathBuf,
    pub batch_limit: usize,
    pub predict_days: i64,
    pub outcome_model_version: String,
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self> {
        let mode = Mode::parse(&env::var("MODE").unwrap_or_else(|_| "process".to_string()))?;
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable must be set")?;
        Ok(Self {
            mode,
            database_url,
            weights_dir: env::var("WEIGHTS_DIR")
                .unwrap_or_else(|_| DEFAULT_WEIGHTS_DIR.to_string())
                .into(),
            batch_limit: env::var("BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_LIMIT),
            predict_days: env::var("PREDICT_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PREDICT_DAYS),
            outcome_model_version: env::var("OUTCOME_MODEL_VERSION")
                .unwrap_or_else(|_| "outcome-v1".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("process").unwrap(), Mode::Process);
        assert_eq!(Mode::parse("PREDICT").unwrap(), Mode::Predict);
        assert!(Mode::parse("train").is_err());
    }
}
