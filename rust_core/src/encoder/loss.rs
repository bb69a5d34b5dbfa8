//! Pretraining objective: reconstruction + β·KL + λ·InfoNCE.
//!
//! Gradients are derived by hand and pushed back through every part of the
//! encoder with [`DenseNetwork::backward`].

use crate::config::EncoderConfig;
use crate::error::{CoreError, Result};
use crate::models::{fit_feature_vector, OutcomeProbs, LATENT_DIM};
use crate::nn::{log_sum_exp, softmax, DenseNetwork};

use super::{EncoderGradients, EncoderParams, LOGVAR_CLAMP};

/// Loss weights pulled out of [`EncoderConfig`].
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub beta: f64,
    pub lambda: f64,
    pub temperature: f64,
}

impl From<&EncoderConfig> for LossWeights {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            beta: config.beta,
            lambda: config.lambda,
            temperature: config.temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossBreakdown {
    pub reconstruction: f64,
    pub kl: f64,
    pub contrastive: f64,
    pub total: f64,
}

impl LossBreakdown {
    pub fn accumulate(&mut self, other: &LossBreakdown) {
        self.reconstruction += other.reconstruction;
        self.kl += other.kl;
        self.contrastive += other.contrastive;
        self.total += other.total;
    }

    pub fn scaled(&self, factor: f64) -> LossBreakdown {
        LossBreakdown {
            reconstruction: self.reconstruction * factor,
            kl: self.kl * factor,
            contrastive: self.contrastive * factor,
            total: self.total * factor,
        }
    }
}

/// InfoNCE with the positive at index 0 of `similarities`.
///
/// Returns the loss and dL/d s_k.
pub fn info_nce(similarities: &[f64]) -> (f64, Vec<f64>) {
    let loss = log_sum_exp(similarities) - similarities[0];
    let mut grad = softmax(similarities);
    grad[0] -= 1.0;
    (loss, grad)
}

/// KL(N(μ, exp(lv)) ‖ N(0, 1)) summed over latent dimensions.
pub fn gaussian_kl(mu: &[f64], logvar: &[f64]) -> f64 {
    mu.iter()
        .zip(logvar)
        .map(|(m, lv)| -0.5 * (1.0 + lv - m * m - lv.exp()))
        .sum()
}

/// Forward (and optionally backward) pass of the objective for one sample.
///
/// `noise` is the reparameterization ε; pass zeros for a deterministic
/// evaluation. When `grads` is `Some`, parameter gradients for this sample
/// are accumulated into it.
#[allow(clippy::too_many_arguments)]
pub fn sample_loss(
    params: &EncoderParams,
    decoder: &DenseNetwork,
    features: &[f64],
    positive: &OutcomeProbs,
    negatives: &[OutcomeProbs],
    noise: &[f64; LATENT_DIM],
    weights: LossWeights,
    grads: Option<&mut EncoderGradients>,
) -> Result<LossBreakdown> {
    if weights.temperature <= 0.0 {
        return Err(CoreError::InvalidConfig("temperature must be > 0".to_string()));
    }
    let x = fit_feature_vector(features)?;

    let trunk_trace = params.trunk.forward_trace(&x)?;
    let h = &trunk_trace.output;
    let mu_trace = params.mu_head.forward_trace(h)?;
    let lv_trace = params.logvar_head.forward_trace(h)?;
    let mu = &mu_trace.output;
    let lv: Vec<f64> = lv_trace
        .output
        .iter()
        .map(|v| v.clamp(-LOGVAR_CLAMP, LOGVAR_CLAMP))
        .collect();
    let sigma: Vec<f64> = lv.iter().map(|v| (0.5 * v).exp()).collect();
    let z: Vec<f64> = (0..LATENT_DIM).map(|i| mu[i] + sigma[i] * noise[i]).collect();

    // Reconstruction (mean squared error)
    let dec_trace = decoder.forward_trace(&z)?;
    let n = x.len() as f64;
    let reconstruction = dec_trace
        .output
        .iter()
        .zip(&x)
        .map(|(xh, xi)| (xh - xi).powi(2))
        .sum::<f64>()
        / n;

    let kl = gaussian_kl(mu, &lv);

    // Contrastive term: positive first, then negatives
    let mut label_traces = Vec::with_capacity(negatives.len() + 1);
    label_traces.push(params.label_embedding.forward_trace(positive)?);
    for neg in negatives {
        label_traces.push(params.label_embedding.forward_trace(neg)?);
    }
    let similarities: Vec<f64> = label_traces
        .iter()
        .map(|t| dot(&z, &t.output) / weights.temperature)
        .collect();
    let (contrastive, d_sim) = info_nce(&similarities);

    let total = reconstruction + weights.beta * kl + weights.lambda * contrastive;
    let breakdown = LossBreakdown {
        reconstruction,
        kl,
        contrastive,
        total,
    };

    let Some(grads) = grads else {
        return Ok(breakdown);
    };

    let d_xhat: Vec<f64> = dec_trace
        .output
        .iter()
        .zip(&x)
        .map(|(xh, xi)| 2.0 * (xh - xi) / n)
        .collect();
    let mut d_z = decoder.backward(&dec_trace, &d_xhat, &mut grads.decoder);

    for (trace, ds) in label_traces.iter().zip(&d_sim) {
        let coef = weights.lambda * ds / weights.temperature;
        if coef == 0.0 {
            continue;
        }
        for (dz, e) in d_z.iter_mut().zip(&trace.output) {
            *dz += coef * e;
        }
        let d_embed: Vec<f64> = z.iter().map(|zi| coef * zi).collect();
        params
            .label_embedding
            .backward(trace, &d_embed, &mut grads.label_embedding);
    }

    let d_mu: Vec<f64> = (0..LATENT_DIM)
        .map(|i| d_z[i] + weights.beta * mu[i])
        .collect();
    let d_lv: Vec<f64> = (0..LATENT_DIM)
        .map(|i| {
            let raw = lv_trace.output[i];
            if raw.abs() >= LOGVAR_CLAMP {
                return 0.0;
            }
            d_z[i] * 0.5 * sigma[i] * noise[i] + weights.beta * 0.5 * (lv[i].exp() - 1.0)
        })
        .collect();

    let dh_mu = params.mu_head.backward(&mu_trace, &d_mu, &mut grads.mu_head);
    let dh_lv = params
        .logvar_head
        .backward(&lv_trace, &d_lv, &mut grads.logvar_head);
    let d_h: Vec<f64> = dh_mu.iter().zip(&dh_lv).map(|(a, b)| a + b).collect();
    params.trunk.backward(&trunk_trace, &d_h, &mut grads.trunk);

    Ok(breakdown)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
