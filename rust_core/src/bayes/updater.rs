//! Per-dimension conjugate Gaussian updating of team posteriors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::{BayesianConfig, SurprisePolicy};
use crate::encoder::LatentDistribution;
use crate::error::{CoreError, Result};
use crate::models::{GameContext, LatentVector, TeamPosterior, TeamSide, LATENT_DIM};

use super::uncertainty::{
    base_observation_sigma, confidence, context_factor, opponent_adjustment, surprise_multiplier,
};

/// A noisy measurement of a team's latent vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub value: LatentVector,
    pub sigma: LatentVector,
    /// Multiplies observation precision; 1.0 for current-season games.
    pub weight: f64,
}

/// How the scalar observation σ was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObservationUncertainty {
    pub base: f64,
    pub context_factor: f64,
    pub surprise_multiplier: f64,
    pub sigma: f64,
}

/// Single-dimension update. Returns (posterior μ, posterior σ).
pub fn conjugate_update(
    prior_mu: f64,
    prior_sigma: f64,
    observed: f64,
    obs_sigma: f64,
    obs_weight: f64,
    min_sigma: f64,
) -> (f64, f64) {
    let prior_precision = 1.0 / (prior_sigma * prior_sigma);
    let obs_precision = obs_weight / (obs_sigma * obs_sigma);
    let post_precision = prior_precision + obs_precision;
    let mu = (prior_mu * prior_precision + observed * obs_precision) / post_precision;
    let sigma = (1.0 / post_precision).sqrt().max(min_sigma);
    (mu, sigma)
}

#[derive(Debug, Clone)]
pub struct SequentialBayesianUpdater {
    config: BayesianConfig,
    surprise: SurprisePolicy,
}

impl SequentialBayesianUpdater {
    pub fn new(config: BayesianConfig, surprise: SurprisePolicy) -> Self {
        Self { config, surprise }
    }

    pub fn config(&self) -> &BayesianConfig {
        &self.config
    }

    /// Prior for a team with no stored posterior.
    pub fn default_posterior(&self, team_id: &str, now: DateTime<Utc>) -> TeamPosterior {
        TeamPosterior::new_default(team_id, self.config.initial_uncertainty, now)
    }

    /// Scalar observation σ for `team` in this game.
    pub fn observation_uncertainty(
        &self,
        team: &TeamPosterior,
        opponent: &TeamPosterior,
        context: &GameContext,
        side: TeamSide,
        actual_margin: Option<f64>,
    ) -> ObservationUncertainty {
        let base = base_observation_sigma(team.games_processed, &self.config);
        let context_factor = context_factor(context, side, &self.config);
        let surprise_multiplier =
            surprise_multiplier(team, opponent, actual_margin, &self.surprise);
        let sigma = (base * context_factor * surprise_multiplier).max(self.config.min_uncertainty);
        ObservationUncertainty {
            base,
            context_factor,
            surprise_multiplier,
            sigma,
        }
    }

    /// Combine the encoder's view of the game with the outcome-likelihood
    /// gradient into an observation.
    ///
    /// The gradient is clipped to unit norm before stepping. Per-dimension
    /// σ adds the encoder's own σ in quadrature.
    pub fn build_observation(
        &self,
        encoded: &LatentDistribution,
        likelihood_gradient: &LatentVector,
        uncertainty: &ObservationUncertainty,
        weight: f64,
    ) -> Observation {
        let norm = likelihood_gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
        let scale = if norm > 1.0 { 1.0 / norm } else { 1.0 };
        let step = self.config.likelihood_step * scale;

        let mut value = [0.0; LATENT_DIM];
        let mut sigma = [0.0; LATENT_DIM];
        for i in 0..LATENT_DIM {
            value[i] = encoded.mu[i] + step * likelihood_gradient[i];
            sigma[i] = (uncertainty.sigma.powi(2) + encoded.sigma[i].powi(2))
                .sqrt()
                .max(self.config.min_uncertainty);
        }
        Observation {
            value,
            sigma,
            weight,
        }
    }

    /// Conjugate update of every dimension, then bookkeeping.
    ///
    /// A prior whose σ lies outside the configured bounds is clamped first.
    pub fn update(
        &self,
        prior: &TeamPosterior,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Result<TeamPosterior> {
        let cfg = &self.config;
        let mut posterior = prior.clone();
        for i in 0..LATENT_DIM {
            let prior_sigma = prior.sigma[i].clamp(cfg.min_uncertainty, cfg.max_uncertainty);
            let (mu, sigma) = conjugate_update(
                prior.mu[i],
                prior_sigma,
                observation.value[i],
                observation.sigma[i],
                observation.weight,
                cfg.min_uncertainty,
            );
            posterior.mu[i] = mu;
            posterior.sigma[i] = sigma.min(cfg.max_uncertainty);
        }
        posterior.games_processed = prior.games_processed.saturating_add(1);
        posterior.confidence = confidence(posterior.games_processed, cfg);
        posterior.last_updated = now;

        if let Err(reason) = posterior.check_structure() {
            return Err(CoreError::InvalidPosteriorFormat {
                team_id: prior.team_id.clone(),
                reason: format!("update produced invalid posterior: {reason}"),
            });
        }

        debug!(
            team_id = %posterior.team_id,
            games = posterior.games_processed,
            mean_sigma = posterior.mean_sigma(),
            confidence = posterior.confidence,
            "Posterior updated"
        );
        Ok(posterior)
    }

    /// Opponent-strength post-adjustment; returns the shift applied.
    pub fn apply_opponent_adjustment(
        &self,
        posterior: &mut TeamPosterior,
        opponent: &TeamPosterior,
        actual_margin: Option<f64>,
    ) -> f64 {
        if !self.config.opponent_adjustment_enabled {
            return 0.0;
        }
        let shift = opponent_adjustment(actual_margin, opponent, &self.config, &self.surprise);
        if shift != 0.0 {
            posterior.mu.iter_mut().for_each(|m| *m += shift);
        }
        shift
    }
}
