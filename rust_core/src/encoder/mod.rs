//! Contrastive game encoder.
//!
//! Maps an 80-dimensional game feature vector to a 16-dimensional Gaussian
//! latent distribution. The encoder is trained once (see [`trainer`]) and
//! then frozen: [`FrozenEncoder`] exposes no mutating methods, and frozen
//! [`EncoderWeights`] refuse every write path.

pub mod loss;
pub mod trainer;

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EncoderConfig;
use crate::error::{CoreError, Result};
use crate::models::{fit_feature_vector, LatentVector, FEATURE_DIM, LATENT_DIM, NUM_OUTCOMES};
use crate::nn::{Activation, Adam, DenseNetwork, NetworkGradients};

pub use loss::{LossBreakdown, LossWeights};
pub use trainer::{Pretrainer, PretrainingSample, StopReason, TrainingReport};

/// Log-variance is clamped to this magnitude before exponentiation.
pub const LOGVAR_CLAMP: f64 = 10.0;

/// Gaussian latent distribution produced by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatentDistribution {
    pub mu: LatentVector,
    pub sigma: LatentVector,
}

impl LatentDistribution {
    /// Bitwise equality of every μ and σ component.
    pub fn bits_equal(&self, other: &Self) -> bool {
        self.mu
            .iter()
            .chain(self.sigma.iter())
            .zip(other.mu.iter().chain(other.sigma.iter()))
            .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Encoder-side parameters: trunk, Gaussian heads and the label embedding
/// used by the contrastive objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderParams {
    pub trunk: DenseNetwork,
    pub mu_head: DenseNetwork,
    pub logvar_head: DenseNetwork,
    pub label_embedding: DenseNetwork,
}

impl EncoderParams {
    fn init(config: &EncoderConfig, rng: &mut StdRng) -> Self {
        let (trunk_hidden, trunk_out) = match config.hidden_dims.split_last() {
            Some((last, rest)) => (rest.to_vec(), *last),
            None => (Vec::new(), LATENT_DIM * 2),
        };
        let mut trunk =
            DenseNetwork::new(FEATURE_DIM, &trunk_hidden, trunk_out, Activation::Relu, rng);
        if let Some(last) = trunk.layers.last_mut() {
            last.activation = Activation::Relu;
        }
        Self {
            trunk,
            mu_head: DenseNetwork::new(trunk_out, &[], LATENT_DIM, Activation::Linear, rng),
            logvar_head: DenseNetwork::new(trunk_out, &[], LATENT_DIM, Activation::Linear, rng),
            label_embedding: DenseNetwork::new(
                NUM_OUTCOMES,
                &[],
                LATENT_DIM,
                Activation::Linear,
                rng,
            ),
        }
    }

    fn validate(&self) -> Result<()> {
        let checks = [
            ("trunk", &self.trunk),
            ("mu_head", &self.mu_head),
            ("logvar_head", &self.logvar_head),
            ("label_embedding", &self.label_embedding),
        ];
        for (name, net) in checks {
            net.validate()
                .map_err(|e| CoreError::InvalidConfig(format!("encoder {name}: {e}")))?;
        }
        if self.trunk.input_dim != FEATURE_DIM {
            return Err(CoreError::dimension("encoder input", FEATURE_DIM, self.trunk.input_dim));
        }
        for (name, net) in [("mu_head", &self.mu_head), ("logvar_head", &self.logvar_head)] {
            if net.input_dim != self.trunk.output_dim() || net.output_dim() != LATENT_DIM {
                return Err(CoreError::InvalidConfig(format!(
                    "encoder {name} shape {}x{} does not match trunk {} -> latent {}",
                    net.input_dim,
                    net.output_dim(),
                    self.trunk.output_dim(),
                    LATENT_DIM
                )));
            }
        }
        if self.label_embedding.input_dim != NUM_OUTCOMES
            || self.label_embedding.output_dim() != LATENT_DIM
        {
            return Err(CoreError::InvalidConfig(
                "label embedding must map outcome labels to the latent space".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic encode: no sampling, no state.
    pub fn encode(&self, features: &[f64]) -> Result<LatentDistribution> {
        let x = fit_feature_vector(features)?;
        let h = self.trunk.forward(&x)?;
        let mu_raw = self.mu_head.forward(&h)?;
        let lv_raw = self.logvar_head.forward(&h)?;

        let mut mu = [0.0; LATENT_DIM];
        let mut sigma = [0.0; LATENT_DIM];
        for i in 0..LATENT_DIM {
            mu[i] = mu_raw[i];
            sigma[i] = (0.5 * lv_raw[i].clamp(-LOGVAR_CLAMP, LOGVAR_CLAMP)).exp();
        }
        Ok(LatentDistribution { mu, sigma })
    }
}

/// Persisted model weights document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderWeights {
    pub model_version: String,
    pub encoder_weights: EncoderParams,
    #[serde(default)]
    pub decoder_weights: Option<DenseNetwork>,
    pub latent_dim: usize,
    pub input_dim: usize,
    pub frozen: bool,
    pub training_completed: bool,
    pub created_at: DateTime<Utc>,
}

impl EncoderWeights {
    pub fn validate(&self) -> Result<()> {
        if self.latent_dim != LATENT_DIM {
            return Err(CoreError::dimension("encoder latent_dim", LATENT_DIM, self.latent_dim));
        }
        if self.input_dim != FEATURE_DIM {
            return Err(CoreError::dimension("encoder input_dim", FEATURE_DIM, self.input_dim));
        }
        self.encoder_weights.validate()?;
        if let Some(decoder) = &self.decoder_weights {
            decoder
                .validate()
                .map_err(|e| CoreError::InvalidConfig(format!("decoder: {e}")))?;
        }
        Ok(())
    }

    /// Replace the encoder parameters. Refused once frozen.
    pub fn replace_params(&mut self, params: EncoderParams) -> Result<()> {
        if self.frozen {
            return Err(CoreError::FrozenEncoderViolation(format!(
                "refusing to overwrite frozen encoder weights {}",
                self.model_version
            )));
        }
        self.encoder_weights = params;
        Ok(())
    }

    /// Stable hash over every encoder parameter bit.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        let p = &self.encoder_weights;
        for net in [&p.trunk, &p.mu_head, &p.logvar_head, &p.label_embedding] {
            for layer in &net.layers {
                for row in &layer.weights {
                    for w in row {
                        w.to_bits().hash(&mut hasher);
                    }
                }
                for b in &layer.bias {
                    b.to_bits().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }
}

/// Per-parameter-group Adam state.
#[derive(Debug, Clone)]
pub(crate) struct EncoderOptimizer {
    trunk: Adam,
    mu_head: Adam,
    logvar_head: Adam,
    label_embedding: Adam,
    decoder: Adam,
}

/// Gradients for every trainable part of the encoder.
#[derive(Debug, Clone)]
pub struct EncoderGradients {
    pub trunk: NetworkGradients,
    pub mu_head: NetworkGradients,
    pub logvar_head: NetworkGradients,
    pub label_embedding: NetworkGradients,
    pub decoder: NetworkGradients,
}

impl EncoderGradients {
    pub fn zeros_like(params: &EncoderParams, decoder: &DenseNetwork) -> Self {
        Self {
            trunk: NetworkGradients::zeros_like(&params.trunk),
            mu_head: NetworkGradients::zeros_like(&params.mu_head),
            logvar_head: NetworkGradients::zeros_like(&params.logvar_head),
            label_embedding: NetworkGradients::zeros_like(&params.label_embedding),
            decoder: NetworkGradients::zeros_like(decoder),
        }
    }

    fn groups_mut(&mut self) -> [&mut NetworkGradients; 5] {
        [
            &mut self.trunk,
            &mut self.mu_head,
            &mut self.logvar_head,
            &mut self.label_embedding,
            &mut self.decoder,
        ]
    }

    pub fn scale(&mut self, factor: f64) {
        for g in self.groups_mut() {
            g.scale(factor);
        }
    }

    pub fn clip_norm(&mut self, max_norm: f64) {
        let total = [
            &self.trunk,
            &self.mu_head,
            &self.logvar_head,
            &self.label_embedding,
            &self.decoder,
        ]
        .iter()
        .map(|g| g.norm().powi(2))
        .sum::<f64>()
        .sqrt();
        if total.is_finite() && total > max_norm {
            self.scale(max_norm / total);
        }
    }
}

/// Trainable encoder/decoder pair used during pretraining only.
#[derive(Debug, Clone)]
pub struct ContrastiveEncoder {
    params: EncoderParams,
    decoder: DenseNetwork,
    optimizer: EncoderOptimizer,
    model_version: String,
}

impl ContrastiveEncoder {
    pub fn new(config: &EncoderConfig, model_version: &str) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = EncoderParams::init(config, &mut rng);
        let decoder = DenseNetwork::new(
            LATENT_DIM,
            &config.decoder_hidden_dims,
            FEATURE_DIM,
            Activation::Relu,
            &mut rng,
        );
        let optimizer = EncoderOptimizer {
            trunk: Adam::new(&params.trunk, config.learning_rate),
            mu_head: Adam::new(&params.mu_head, config.learning_rate),
            logvar_head: Adam::new(&params.logvar_head, config.learning_rate),
            label_embedding: Adam::new(&params.label_embedding, config.learning_rate),
            decoder: Adam::new(&decoder, config.learning_rate),
        };
        Self {
            params,
            decoder,
            optimizer,
            model_version: model_version.to_string(),
        }
    }

    /// Resume training from an unfrozen checkpoint.
    pub fn from_weights(weights: EncoderWeights, config: &EncoderConfig) -> Result<Self> {
        if weights.frozen {
            return Err(CoreError::FrozenEncoderViolation(format!(
                "weights {} are frozen and cannot be reopened for training",
                weights.model_version
            )));
        }
        weights.validate()?;
        let mut encoder = Self::new(config, &weights.model_version);
        encoder.params = weights.encoder_weights;
        if let Some(decoder) = weights.decoder_weights {
            encoder.decoder = decoder;
        }
        encoder.optimizer = EncoderOptimizer {
            trunk: Adam::new(&encoder.params.trunk, config.learning_rate),
            mu_head: Adam::new(&encoder.params.mu_head, config.learning_rate),
            logvar_head: Adam::new(&encoder.params.logvar_head, config.learning_rate),
            label_embedding: Adam::new(&encoder.params.label_embedding, config.learning_rate),
            decoder: Adam::new(&encoder.decoder, config.learning_rate),
        };
        Ok(encoder)
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    pub fn decoder(&self) -> &DenseNetwork {
        &self.decoder
    }

    pub fn encode(&self, features: &[f64]) -> Result<LatentDistribution> {
        self.params.encode(features)
    }

    pub fn zero_gradients(&self) -> EncoderGradients {
        EncoderGradients::zeros_like(&self.params, &self.decoder)
    }

    /// Apply one optimizer step.
    pub fn apply_gradients(&mut self, grads: &EncoderGradients) {
        let opt = &mut self.optimizer;
        opt.trunk.step(&mut self.params.trunk, &grads.trunk);
        opt.mu_head.step(&mut self.params.mu_head, &grads.mu_head);
        opt.logvar_head.step(&mut self.params.logvar_head, &grads.logvar_head);
        opt.label_embedding
            .step(&mut self.params.label_embedding, &grads.label_embedding);
        opt.decoder.step(&mut self.decoder, &grads.decoder);
    }

    /// Restore a parameter snapshot (used to roll back to the best epoch).
    pub(crate) fn restore(&mut self, params: EncoderParams, decoder: DenseNetwork) {
        self.params = params;
        self.decoder = decoder;
    }

    /// Snapshot the current parameters as an unfrozen checkpoint.
    pub fn checkpoint(&self) -> EncoderWeights {
        EncoderWeights {
            model_version: self.model_version.clone(),
            encoder_weights: self.params.clone(),
            decoder_weights: Some(self.decoder.clone()),
            latent_dim: LATENT_DIM,
            input_dim: FEATURE_DIM,
            frozen: false,
            training_completed: false,
            created_at: Utc::now(),
        }
    }

    /// Finish training: move parameters into an immutable encoder.
    ///
    /// Consumes `self`, so no trainable handle survives the freeze.
    pub fn freeze(self) -> FrozenEncoder {
        let weights = EncoderWeights {
            model_version: self.model_version.clone(),
            encoder_weights: self.params,
            decoder_weights: Some(self.decoder),
            latent_dim: LATENT_DIM,
            input_dim: FEATURE_DIM,
            frozen: true,
            training_completed: true,
            created_at: Utc::now(),
        };
        info!(
            version = %weights.model_version,
            fingerprint = weights.fingerprint(),
            "Encoder frozen"
        );
        FrozenEncoder {
            weights: Arc::new(weights),
        }
    }
}

/// Immutable encoder used after pretraining. Cloning shares the weights.
#[derive(Debug, Clone)]
pub struct FrozenEncoder {
    weights: Arc<EncoderWeights>,
}

impl FrozenEncoder {
    /// Load from a persisted document. Only completed, frozen weights are accepted.
    pub fn from_weights(weights: EncoderWeights) -> Result<Self> {
        weights.validate()?;
        if !weights.frozen || !weights.training_completed {
            return Err(CoreError::InvalidConfig(format!(
                "encoder weights {} are not frozen (frozen={}, training_completed={})",
                weights.model_version, weights.frozen, weights.training_completed
            )));
        }
        Ok(Self {
            weights: Arc::new(weights),
        })
    }

    pub fn weights(&self) -> &EncoderWeights {
        &self.weights
    }

    pub fn version(&self) -> &str {
        &self.weights.model_version
    }

    pub fn fingerprint(&self) -> u64 {
        self.weights.fingerprint()
    }

    pub fn encode(&self, features: &[f64]) -> Result<LatentDistribution> {
        self.weights.encoder_weights.encode(features)
    }

    /// Check that repeated encodes of `features` are bit-identical.
    pub fn verify_repeatable(&self, features: &[f64], iterations: usize) -> Result<()> {
        let reference = self.encode(features)?;
        for i in 1..iterations {
            let again = self.encode(features)?;
            if !again.bits_equal(&reference) {
                return Err(CoreError::FrozenEncoderViolation(format!(
                    "encode output changed on call {i}"
                )));
            }
        }
        Ok(())
    }
}
