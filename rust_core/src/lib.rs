//! Hoopcast Core - latent team representations and game simulation.
//!
//! This crate provides:
//! - Contrastive pretraining of a game-feature encoder, frozen afterwards
//! - Per-team Gaussian posteriors with a validated, cached store
//! - Sequential conjugate Bayesian updating driven by an outcome model
//! - Season-boundary variance injection
//! - Possession-outcome prediction and Monte Carlo game simulation
//! - Expected-value screening against market odds

pub mod bayes;
pub mod config;
pub mod db;
pub mod encoder;
pub mod error;
pub mod ev;
pub mod models;
pub mod nn;
pub mod outcome;
pub mod pipeline;
pub mod posterior;
pub mod retry;
pub mod season;
pub mod simulation;
pub mod weights;

pub use config::PipelineConfig;
pub use error::{CoreError, Result};
pub use pipeline::{GameSource, InMemoryGameSource, ProcessingSummary, SequentialProcessor};
