//! Outcome transition model.
//!
//! Maps two team posteriors plus game context to a distribution over the
//! eight possession outcomes. Trained online with cross-entropy against the
//! observed outcome vector. The model only ever sees posterior moments, so
//! its backward pass never reaches the encoder.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OutcomeModelConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    GameContext, LatentVector, OutcomeProbs, TeamPosterior, TeamSide, CONTEXT_DIM, LATENT_DIM,
    NUM_OUTCOMES,
};
use crate::nn::{softmax, Activation, Adam, DenseNetwork, NetworkGradients};

/// [team μ, team σ², opponent μ, opponent σ², context]
pub const OUTCOME_INPUT_DIM: usize = 4 * LATENT_DIM + CONTEXT_DIM;

/// Probabilities are floored here before taking logs.
const PROB_FLOOR: f64 = 1e-12;

/// Persisted outcome model document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeModelWeights {
    pub model_version: String,
    pub network: DenseNetwork,
    pub input_dim: usize,
    pub num_outcomes: usize,
    pub training_steps: u64,
    pub updated_at: DateTime<Utc>,
}

impl OutcomeModelWeights {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim != OUTCOME_INPUT_DIM || self.network.input_dim != OUTCOME_INPUT_DIM {
            return Err(CoreError::dimension(
                "outcome model input",
                OUTCOME_INPUT_DIM,
                self.network.input_dim,
            ));
        }
        if self.num_outcomes != NUM_OUTCOMES || self.network.output_dim() != NUM_OUTCOMES {
            return Err(CoreError::dimension(
                "outcome model output",
                NUM_OUTCOMES,
                self.network.output_dim(),
            ));
        }
        self.network
            .validate()
            .map_err(|e| CoreError::InvalidConfig(format!("outcome model: {e}")))
    }
}

/// One supervised example: model input and its soft target.
#[derive(Debug, Clone)]
pub struct OutcomeExample {
    pub input: Vec<f64>,
    pub target: OutcomeProbs,
}

/// Build the model input from `team`'s perspective.
pub fn build_input(
    team: &TeamPosterior,
    opponent: &TeamPosterior,
    context: &[f64; CONTEXT_DIM],
) -> Vec<f64> {
    let mut input = Vec::with_capacity(OUTCOME_INPUT_DIM);
    input.extend_from_slice(&team.mu);
    input.extend(team.variance());
    input.extend_from_slice(&opponent.mu);
    input.extend(opponent.variance());
    input.extend_from_slice(context);
    input
}

/// Soft-label cross-entropy: -Σ y·log p.
pub fn cross_entropy(predicted: &[f64], target: &[f64]) -> f64 {
    predicted
        .iter()
        .zip(target)
        .map(|(p, y)| -y * p.max(PROB_FLOOR).ln())
        .sum()
}

#[derive(Debug, Clone)]
pub struct OutcomeTransitionModel {
    network: DenseNetwork,
    optimizer: Adam,
    model_version: String,
    training_steps: u64,
}

impl OutcomeTransitionModel {
    pub fn new(config: &OutcomeModelConfig, model_version: &str) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let network = DenseNetwork::new(
            OUTCOME_INPUT_DIM,
            &config.hidden_dims,
            NUM_OUTCOMES,
            Activation::Relu,
            &mut rng,
        );
        let optimizer = Adam::new(&network, config.learning_rate);
        Self {
            network,
            optimizer,
            model_version: model_version.to_string(),
            training_steps: 0,
        }
    }

    pub fn from_weights(weights: OutcomeModelWeights, config: &OutcomeModelConfig) -> Result<Self> {
        weights.validate()?;
        let optimizer = Adam::new(&weights.network, config.learning_rate);
        Ok(Self {
            network: weights.network,
            optimizer,
            model_version: weights.model_version,
            training_steps: weights.training_steps,
        })
    }

    pub fn to_weights(&self) -> OutcomeModelWeights {
        OutcomeModelWeights {
            model_version: self.model_version.clone(),
            network: self.network.clone(),
            input_dim: OUTCOME_INPUT_DIM,
            num_outcomes: NUM_OUTCOMES,
            training_steps: self.training_steps,
            updated_at: Utc::now(),
        }
    }

    pub fn training_steps(&self) -> u64 {
        self.training_steps
    }

    /// Outcome distribution for `side`'s offense in a game.
    pub fn predict(
        &self,
        team: &TeamPosterior,
        opponent: &TeamPosterior,
        context: &GameContext,
        side: TeamSide,
    ) -> Result<OutcomeProbs> {
        self.predict_input(&build_input(team, opponent, &context.to_vector(side)))
    }

    pub fn predict_input(&self, input: &[f64]) -> Result<OutcomeProbs> {
        let logits = self.network.forward(input)?;
        to_probs(&softmax(&logits))
    }

    /// One Adam step on the mean loss of `examples`. Returns the mean
    /// cross-entropy measured before the step.
    pub fn train_batch(&mut self, examples: &[OutcomeExample]) -> Result<f64> {
        if examples.is_empty() {
            return Ok(0.0);
        }
        let mut grads = NetworkGradients::zeros_like(&self.network);
        let mut total = 0.0;
        for example in examples {
            let trace = self.network.forward_trace(&example.input)?;
            let probs = softmax(&trace.output);
            total += cross_entropy(&probs, &example.target);
            let grad_logits: Vec<f64> = probs
                .iter()
                .zip(&example.target)
                .map(|(p, y)| p - y)
                .collect();
            self.network.backward(&trace, &grad_logits, &mut grads);
        }
        let n = examples.len() as f64;
        grads.scale(1.0 / n);
        self.optimizer.step(&mut self.network, &grads);
        self.training_steps += 1;

        let loss = total / n;
        debug!(steps = self.training_steps, loss, "Outcome model step");
        Ok(loss)
    }

    /// Gradient of log p(target) with respect to the team-μ slot of the input.
    pub fn team_mean_gradient(&self, input: &[f64], target: &OutcomeProbs) -> Result<LatentVector> {
        let trace = self.network.forward_trace(input)?;
        let probs = softmax(&trace.output);
        // d(-CE)/d logits = y - p
        let grad_logits: Vec<f64> = probs
            .iter()
            .zip(target)
            .map(|(p, y)| y - p)
            .collect();
        let mut scratch = NetworkGradients::zeros_like(&self.network);
        let grad_input = self.network.backward(&trace, &grad_logits, &mut scratch);

        let mut out = [0.0; LATENT_DIM];
        out.copy_from_slice(&grad_input[..LATENT_DIM]);
        Ok(out)
    }
}

fn to_probs(values: &[f64]) -> Result<OutcomeProbs> {
    if values.len() != NUM_OUTCOMES {
        return Err(CoreError::dimension("outcome distribution", NUM_OUTCOMES, values.len()));
    }
    let mut out = [0.0; NUM_OUTCOMES];
    out.copy_from_slice(values);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn small_model() -> OutcomeTransitionModel {
        let config = OutcomeModelConfig {
            hidden_dims: vec![16, 8],
            learning_rate: 1e-2,
            seed: 3,
        };
        OutcomeTransitionModel::new(&config, "outcome-test")
    }

    fn posterior(id: &str, level: f64) -> TeamPosterior {
        let mut p = TeamPosterior::new_default(id, 1.0, Utc::now());
        p.mu = [level; LATENT_DIM];
        p
    }

    #[test]
    fn test_prediction_is_distribution() {
        let model = small_model();
        let probs = model
            .predict(
                &posterior("A", 0.3),
                &posterior("B", -0.2),
                &GameContext::default(),
                TeamSide::Home,
            )
            .unwrap();
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(probs.iter().all(|p| *p > 0.0));
    }

    #[test]
    fn test_perspectives_differ() {
        let model = small_model();
        let a = posterior("A", 0.5);
        let b = posterior("B", -0.5);
        let ctx = GameContext::default();
        let home = model.predict(&a, &b, &ctx, TeamSide::Home).unwrap();
        let away = model.predict(&b, &a, &ctx, TeamSide::Away).unwrap();
        assert_ne!(home, away);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut model = small_model();
        let context = GameContext::default().to_vector(TeamSide::Home);
        let input = build_input(&posterior("A", 0.2), &posterior("B", 0.1), &context);
        let mut target = [0.0; NUM_OUTCOMES];
        target[2] = 0.7;
        target[7] = 0.3;
        let example = OutcomeExample { input, target };

        let first = model.train_batch(std::slice::from_ref(&example)).unwrap();
        let mut last = first;
        for _ in 0..100 {
            last = model.train_batch(std::slice::from_ref(&example)).unwrap();
        }
        assert!(last < first);
        assert_eq!(model.training_steps(), 101);
    }

    #[test]
    fn test_team_mean_gradient_matches_finite_difference() {
        let model = small_model();
        let context = GameContext::default().to_vector(TeamSide::Home);
        let input = build_input(&posterior("A", 0.1), &posterior("B", -0.1), &context);
        let mut target = [0.0; NUM_OUTCOMES];
        target[0] = 1.0;
        let grad = model.team_mean_gradient(&input, &target).unwrap();

        let log_lik = |x: &[f64]| -cross_entropy(&model.predict_input(x).unwrap(), &target);
        let eps = 1e-6;
        for i in [0, 7, 15] {
            let mut plus = input.clone();
            let mut minus = input.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (log_lik(&plus) - log_lik(&minus)) / (2.0 * eps);
            assert!((numeric - grad[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_weights_round_trip_rejects_bad_shape() {
        let model = small_model();
        let mut weights = model.to_weights();
        assert!(weights.validate().is_ok());
        weights.num_outcomes = 7;
        let config = OutcomeModelConfig::default();
        assert!(OutcomeTransitionModel::from_weights(weights, &config).is_err());
    }
}
