//! Pretrainer Rust Service
//!
//! One-shot contrastive pretraining of the game-feature encoder.
//!
//! This service:
//! - Reads historical game labels and feature vectors from Postgres
//! - Trains the encoder with early stopping on a held-out split
//! - Freezes it and writes the weights document
//!
//! Refuses to run when a frozen encoder is already on disk.

mod config;

use anyhow::{bail, Context, Result};
use dotenv::dotenv;
use hoopcast_rust_core::db::{create_pool, DbPoolConfig, PgGameSource};
use hoopcast_rust_core::encoder::Pretrainer;
use hoopcast_rust_core::pipeline::GameSource;
use hoopcast_rust_core::weights::WeightsRepository;
use hoopcast_rust_core::PipelineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::PretrainerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Pretrainer Rust Service...");

    let service = PretrainerConfig::from_env()?;
    let pipeline = PipelineConfig::from_env();
    pipeline.validate().context("Invalid pipeline configuration")?;
    pipeline.log_config();

    let repo = WeightsRepository::new(&service.weights_dir);
    if let Some(existing) = repo.read_encoder_weights()? {
        if existing.frozen {
            bail!(
                "Encoder {} at {} is already frozen; refusing to retrain",
                existing.model_version,
                repo.encoder_path().display()
            );
        }
    }

    let pool_config = DbPoolConfig::from_env_with_defaults(DbPoolConfig::sequential());
    let pool = create_pool(&service.database_url, &pool_config).await?;
    let source = PgGameSource::new(pool);
    let samples = source
        .fetch_training_samples(service.sample_limit)
        .await
        .context("Failed to load pretraining samples")?;
    let sample_features = samples.first().map(|s| s.features.clone());

    let version = service.model_version.clone();
    let encoder_config = pipeline.encoder.clone();
    let (encoder, report) = tokio::task::spawn_blocking(move || {
        Pretrainer::new(encoder_config)?.train(&samples, &version)
    })
    .await
    .context("Pretraining task panicked")?
    .context("Pretraining failed")?;

    if let Some(sample_features) = sample_features {
        encoder
            .verify_repeatable(&sample_features, 10)
            .context("Frozen encoder is not repeatable")?;
    }

    repo.save_frozen_encoder(&encoder)
        .context("Failed to write encoder weights")?;

    info!(
        "Pretraining complete: {}",
        serde_json::to_string(&report).unwrap_or_default()
    );
    info!(
        "Frozen encoder {} written to {}",
        encoder.version(),
        repo.encoder_path().display()
    );
    Ok(())
}
