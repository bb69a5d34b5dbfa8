//! Game Processor Rust Service
//!
//! Sequential posterior updates and upcoming-game pricing.
//!
//! MODE=process:
//! - Reads unprocessed game labels in date order
//! - Updates both teams' posteriors one game at a time
//! - Checkpoints the outcome model after every committed game
//!
//! MODE=predict:
//! - Simulates games scheduled in the next PREDICT_DAYS days
//! - Logs positive expected-value opportunities

mod config;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use dotenv::dotenv;
use hoopcast_rust_core::db::{create_pool, DbPoolConfig, PgGameSource, PgPosteriorBackend};
use hoopcast_rust_core::outcome::OutcomeTransitionModel;
use hoopcast_rust_core::posterior::{PosteriorCache, PosteriorStore};
use hoopcast_rust_core::weights::WeightsRepository;
use hoopcast_rust_core::{PipelineConfig, SequentialProcessor};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Mode, ProcessorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Game Processor Rust Service...");

    let service = ProcessorConfig::from_env()?;
    let pipeline = PipelineConfig::from_env();
    pipeline.validate().context("Invalid pipeline configuration")?;
    pipeline.log_config();
    info!("Mode: {:?}", service.mode);

    let repo = WeightsRepository::new(&service.weights_dir);
    let encoder = repo
        .load_frozen_encoder()
        .context("No usable frozen encoder; run the pretrainer first")?;
    info!("Loaded frozen encoder {}", encoder.version());

    let outcome_model = match repo.load_outcome_model()? {
        Some(weights) => {
            info!("Loaded outcome model {}", weights.model_version);
            OutcomeTransitionModel::from_weights(weights, &pipeline.outcome_model)?
        }
        None => {
            warn!(
                "No outcome model at {}; starting {} from scratch",
                repo.outcome_path().display(),
                service.outcome_model_version
            );
            OutcomeTransitionModel::new(&pipeline.outcome_model, &service.outcome_model_version)
        }
    };

    let pool_config = DbPoolConfig::from_env_with_defaults(DbPoolConfig::sequential());
    let pool = create_pool(&service.database_url, &pool_config).await?;
    let store = PosteriorStore::new(
        Arc::new(PgPosteriorBackend::new(pool.clone())),
        Arc::new(PosteriorCache::new(&pipeline.cache)),
        pipeline.bayesian.clone(),
    );
    let source = PgGameSource::new(pool);
    let mut processor = SequentialProcessor::new(&pipeline, encoder, outcome_model, store)
        .with_model_checkpoint(Arc::new(repo.clone()));

    match service.mode {
        Mode::Process => {
            let summary = processor.process_batch(&source, service.batch_limit).await?;
            info!(
                "Outcome model at {} steps in {}",
                processor.outcome_model().training_steps(),
                repo.outcome_path().display()
            );
            info!(
                "Session report: {}",
                serde_json::to_string(&summary).unwrap_or_default()
            );
        }
        Mode::Predict => {
            let today = Utc::now().date_naive();
            let until = today + Duration::days(service.predict_days);
            let reports = processor.predict_upcoming(&source, today, until).await?;
            info!("Priced {} upcoming games ({} to {})", reports.len(), today, until);
            for report in &reports {
                if let Some(warning) = &report.convergence_warning {
                    warn!("{}: {}", report.game_id, warning);
                }
                info!(
                    "Prediction: {}",
                    serde_json::to_string(report).unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
