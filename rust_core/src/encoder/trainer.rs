//! One-time contrastive pretraining with early stopping.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EncoderConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    fit_feature_vector, normalize_outcome_probs, GameRecord, OutcomeProbs, TeamSide, LATENT_DIM,
};

use super::loss::{sample_loss, LossBreakdown, LossWeights};
use super::{ContrastiveEncoder, FrozenEncoder};

/// Gradient norm cap applied to each averaged mini-batch.
const MAX_GRAD_NORM: f64 = 5.0;

/// One historical team-game: features plus the observed outcome label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PretrainingSample {
    pub game_id: String,
    pub features: Vec<f64>,
    pub label: OutcomeProbs,
}

impl PretrainingSample {
    /// Both teams' views of a completed game.
    pub fn from_record(record: &GameRecord) -> [PretrainingSample; 2] {
        [TeamSide::Home, TeamSide::Away].map(|side| PretrainingSample {
            game_id: record.label.game_id.clone(),
            features: record.features(side).to_vec(),
            label: *record.label.probs(side),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Validation loss failed to improve for `patience` epochs.
    Patience,
    /// Successive validation losses differed by less than the threshold.
    Converged,
    MaxEpochs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub model_version: String,
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_validation_loss: f64,
    pub final_train_loss: f64,
    pub stop_reason: StopReason,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub skipped_samples: usize,
}

struct PreparedSample {
    game_id: String,
    features: Vec<f64>,
    label: OutcomeProbs,
}

pub struct Pretrainer {
    config: EncoderConfig,
}

impl Pretrainer {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Train a fresh encoder on `samples`, then freeze it.
    pub fn train(
        &self,
        samples: &[PretrainingSample],
        model_version: &str,
    ) -> Result<(FrozenEncoder, TrainingReport)> {
        let (prepared, skipped) = prepare(samples);
        if prepared.len() < 2 {
            return Err(CoreError::InsufficientTrainingData(format!(
                "{} valid samples (of {}), need at least 2",
                prepared.len(),
                samples.len()
            )));
        }
        if prepared.iter().all(|s| s.game_id == prepared[0].game_id) {
            return Err(CoreError::InsufficientTrainingData(format!(
                "all {} valid samples come from game {}, negatives need another game",
                prepared.len(),
                prepared[0].game_id
            )));
        }
        if skipped > 0 {
            warn!(skipped, "Skipped invalid pretraining samples");
        }

        let cfg = &self.config;
        let weights = LossWeights::from(cfg);
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let mut order: Vec<usize> = (0..prepared.len()).collect();
        order.shuffle(&mut rng);
        let n_val = ((prepared.len() as f64 * cfg.validation_split).round() as usize)
            .clamp(1, prepared.len() - 1);
        let (val_idx, train_idx) = order.split_at(n_val);
        let mut train_idx = train_idx.to_vec();

        // Validation negatives are fixed so epoch losses are comparable
        let mut val_rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));
        let val_negatives: Vec<Vec<OutcomeProbs>> = val_idx
            .iter()
            .map(|&i| draw_negatives(&prepared, i, cfg.negatives_per_sample, &mut val_rng))
            .collect();

        info!(
            version = model_version,
            train = train_idx.len(),
            validation = val_idx.len(),
            "Starting contrastive pretraining"
        );

        let mut encoder = ContrastiveEncoder::new(cfg, model_version);
        let mut best_val = f64::INFINITY;
        let mut best_epoch = 0;
        let mut best_snapshot = (encoder.params().clone(), encoder.decoder().clone());
        let mut prev_val: Option<f64> = None;
        let mut stale_epochs = 0;
        let mut final_train_loss = f64::NAN;
        let mut stop_reason = StopReason::MaxEpochs;
        let mut epochs_run = 0;

        for epoch in 1..=cfg.max_epochs {
            epochs_run = epoch;
            train_idx.shuffle(&mut rng);

            let mut epoch_loss = LossBreakdown::default();
            for batch in train_idx.chunks(cfg.batch_size) {
                let mut grads = encoder.zero_gradients();
                for &i in batch {
                    let sample = &prepared[i];
                    let negatives =
                        draw_negatives(&prepared, i, cfg.negatives_per_sample, &mut rng);
                    let noise = sample_noise(&mut rng);
                    let loss = sample_loss(
                        encoder.params(),
                        encoder.decoder(),
                        &sample.features,
                        &sample.label,
                        &negatives,
                        &noise,
                        weights,
                        Some(&mut grads),
                    )?;
                    epoch_loss.accumulate(&loss);
                }
                grads.scale(1.0 / batch.len() as f64);
                grads.clip_norm(MAX_GRAD_NORM);
                encoder.apply_gradients(&grads);
            }
            let train_loss = epoch_loss.scaled(1.0 / train_idx.len() as f64);
            final_train_loss = train_loss.total;

            let val_loss = validation_loss(&encoder, &prepared, val_idx, &val_negatives, weights)?;
            debug!(
                epoch,
                train = train_loss.total,
                recon = train_loss.reconstruction,
                kl = train_loss.kl,
                nce = train_loss.contrastive,
                validation = val_loss,
                "Pretraining epoch"
            );

            if val_loss < best_val {
                best_val = val_loss;
                best_epoch = epoch;
                best_snapshot = (encoder.params().clone(), encoder.decoder().clone());
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
            }

            if let Some(prev) = prev_val {
                if (prev - val_loss).abs() < cfg.convergence_threshold {
                    stop_reason = StopReason::Converged;
                    break;
                }
            }
            if stale_epochs >= cfg.patience {
                stop_reason = StopReason::Patience;
                break;
            }
            prev_val = Some(val_loss);
        }

        let (params, decoder) = best_snapshot;
        encoder.restore(params, decoder);

        let report = TrainingReport {
            model_version: model_version.to_string(),
            epochs_run,
            best_epoch,
            best_validation_loss: best_val,
            final_train_loss,
            stop_reason,
            train_samples: train_idx.len(),
            validation_samples: val_idx.len(),
            skipped_samples: skipped,
        };
        info!(
            version = model_version,
            epochs = report.epochs_run,
            best_epoch = report.best_epoch,
            best_validation_loss = report.best_validation_loss,
            stop = ?report.stop_reason,
            "Pretraining finished"
        );

        Ok((encoder.freeze(), report))
    }
}

fn prepare(samples: &[PretrainingSample]) -> (Vec<PreparedSample>, usize) {
    let mut prepared = Vec::with_capacity(samples.len());
    let mut skipped = 0;
    for sample in samples {
        let features = fit_feature_vector(&sample.features);
        let label = normalize_outcome_probs(&sample.label);
        match (features, label) {
            (Ok(features), Ok(label)) => prepared.push(PreparedSample {
                game_id: sample.game_id.clone(),
                features,
                label,
            }),
            (Err(e), _) | (_, Err(e)) => {
                debug!(game_id = %sample.game_id, error = %e, "Dropping pretraining sample");
                skipped += 1;
            }
        }
    }
    (prepared, skipped)
}

/// Labels from other games, sampled with replacement.
///
/// Both views of the anchor's game are excluded. The caller guarantees at
/// least two distinct games.
fn draw_negatives(
    samples: &[PreparedSample],
    anchor: usize,
    count: usize,
    rng: &mut StdRng,
) -> Vec<OutcomeProbs> {
    let game_id = &samples[anchor].game_id;
    (0..count)
        .map(|_| loop {
            let j = rng.gen_range(0..samples.len());
            if samples[j].game_id != *game_id {
                break samples[j].label;
            }
        })
        .collect()
}

fn sample_noise(rng: &mut StdRng) -> [f64; LATENT_DIM] {
    let mut eps = [0.0; LATENT_DIM];
    for e in eps.iter_mut() {
        *e = StandardNormal.sample(rng);
    }
    eps
}

/// Mean loss over the held-out split with the latent mean (ε = 0).
fn validation_loss(
    encoder: &ContrastiveEncoder,
    samples: &[PreparedSample],
    val_idx: &[usize],
    val_negatives: &[Vec<OutcomeProbs>],
    weights: LossWeights,
) -> Result<f64> {
    let zero = [0.0; LATENT_DIM];
    let mut total = 0.0;
    for (&i, negatives) in val_idx.iter().zip(val_negatives) {
        let sample = &samples[i];
        total += sample_loss(
            encoder.params(),
            encoder.decoder(),
            &sample.features,
            &sample.label,
            negatives,
            &zero,
            weights,
            None,
        )?
        .total;
    }
    Ok(total / val_idx.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FEATURE_DIM, NUM_OUTCOMES};

    fn synthetic_samples(n: usize) -> Vec<PretrainingSample> {
        (0..n)
            .map(|i| {
                let style = i % 2;
                let features: Vec<f64> = (0..FEATURE_DIM)
                    .map(|f| if (f % 2) == style { 0.8 } else { 0.1 } + (i as f64) * 1e-3)
                    .collect();
                let mut label = [0.05; NUM_OUTCOMES];
                label[if style == 0 { 0 } else { 2 }] = 1.0 - 0.05 * (NUM_OUTCOMES - 1) as f64;
                PretrainingSample {
                    game_id: format!("g{i}"),
                    features,
                    label,
                }
            })
            .collect()
    }

    fn fast_config() -> EncoderConfig {
        EncoderConfig {
            hidden_dims: vec![16, 8],
            decoder_hidden_dims: vec![8],
            max_epochs: 15,
            batch_size: 8,
            negatives_per_sample: 3,
            learning_rate: 5e-3,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_insufficient_data() {
        let trainer = Pretrainer::new(fast_config()).unwrap();
        let err = trainer.train(&[], "v0").unwrap_err();
        assert!(matches!(err, CoreError::InsufficientTrainingData(_)));

        let mut bad = synthetic_samples(3);
        for s in &mut bad {
            s.label = [0.0; NUM_OUTCOMES];
        }
        assert!(matches!(
            trainer.train(&bad, "v0"),
            Err(CoreError::InsufficientTrainingData(_))
        ));
    }

    #[test]
    fn test_training_produces_frozen_encoder() {
        let trainer = Pretrainer::new(fast_config()).unwrap();
        let samples = synthetic_samples(40);
        let (encoder, report) = trainer.train(&samples, "v-test").unwrap();

        assert!(encoder.weights().frozen);
        assert!(report.epochs_run >= 1 && report.epochs_run <= 15);
        assert!(report.best_epoch >= 1 && report.best_epoch <= report.epochs_run);
        assert!(report.best_validation_loss.is_finite());
        assert_eq!(report.train_samples + report.validation_samples, 40);
        encoder.verify_repeatable(&samples[0].features, 10).unwrap();
    }

    #[test]
    fn test_training_is_deterministic_for_seed() {
        let trainer = Pretrainer::new(fast_config()).unwrap();
        let samples = synthetic_samples(20);
        let (a, _) = trainer.train(&samples, "v").unwrap();
        let (b, _) = trainer.train(&samples, "v").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_negatives_never_include_self() {
        // Samples 1 and 2 are the two sides of the same game
        let games = ["g0", "g1", "g1", "g2"];
        let samples: Vec<PreparedSample> = games
            .iter()
            .enumerate()
            .map(|(i, game_id)| {
                let mut label = [0.0; NUM_OUTCOMES];
                label[i] = 1.0;
                PreparedSample {
                    game_id: game_id.to_string(),
                    features: vec![0.0; FEATURE_DIM],
                    label,
                }
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let negs = draw_negatives(&samples, 1, 4, &mut rng);
            assert_eq!(negs.len(), 4);
            assert!(negs.iter().all(|n| n[1] != 1.0 && n[2] != 1.0));
        }
    }

    #[test]
    fn test_single_game_is_insufficient() {
        let trainer = Pretrainer::new(fast_config()).unwrap();
        let mut samples = synthetic_samples(2);
        samples[1].game_id = samples[0].game_id.clone();
        assert!(matches!(
            trainer.train(&samples, "v0"),
            Err(CoreError::InsufficientTrainingData(_))
        ));
    }
}
