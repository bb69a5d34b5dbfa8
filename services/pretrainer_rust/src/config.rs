//! Environment loading for the pretrainer.

use anyhow::{Context, Result};
use chrono::Utc;
use std::env;
use std::path::PathBuf;

/// Default directory holding model weight documents
pub const DEFAULT_WEIGHTS_DIR: &str = "./models";

/// Default cap on game rows read for pretraining
pub const DEFAULT_SAMPLE_LIMIT: usize = 50_000;

#[derive(Debug, Clone)]
pub struct PretrainerConfig {
    pub database_url: String,
    pub weights_dir: PathBuf,
    pub sample_limit: usize,
    pub model_version: String,
}

impl PretrainerConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable must be set")?;
        let weights_dir = env::var("WEIGHTS_DIR")
            .unwrap_or_else(|_| DEFAULT_WEIGHTS_DIR.to_string())
            .into();
        let sample_limit = env::var("PRETRAIN_SAMPLE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SAMPLE_LIMIT);
        let model_version = env::var("ENCODER_MODEL_VERSION")
            .unwrap_or_else(|_| format!("encoder-{}", Utc::now().format("%Y%m%d%H%M%S")));
        Ok(Self {
            database_url,
            weights_dir,
            sample_limit,
            model_version,
        })
    }
}
