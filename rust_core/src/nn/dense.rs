//! Dense feed-forward networks (CPU-only) with training support.
//!
//! Weights are stored row-major as `[out_dim][in_dim]` so a serialized
//! network is plain JSON. Shapes are validated on load; a network that
//! fails validation is never used.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
}

impl Activation {
    fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
        }
    }

    /// Derivative evaluated at the pre-activation value.
    fn derivative(&self, pre: f64) -> f64 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if pre > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// Weights shape: [out_dim][in_dim]
    pub weights: Vec<Vec<f64>>,
    /// Bias shape: [out_dim]
    pub bias: Vec<f64>,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseLayer {
    /// He-uniform initialization for ReLU layers, Xavier-uniform otherwise.
    pub fn init<R: Rng>(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let limit = match activation {
            Activation::Relu => (6.0 / in_dim as f64).sqrt(),
            Activation::Linear => (6.0 / (in_dim + out_dim) as f64).sqrt(),
        };
        let weights = (0..out_dim)
            .map(|_| (0..in_dim).map(|_| rng.gen_range(-limit..limit)).collect())
            .collect();
        Self {
            weights,
            bias: vec![0.0; out_dim],
            activation,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weights.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn out_dim(&self) -> usize {
        self.weights.len()
    }

    fn pre_activation(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| b + row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>())
            .collect()
    }
}

/// Per-layer activations recorded during a training forward pass.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    /// Input fed to each layer.
    inputs: Vec<Vec<f64>>,
    /// Pre-activation output of each layer.
    pre: Vec<Vec<f64>>,
    pub output: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerGradients {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

/// Accumulated parameter gradients, shaped like the network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkGradients {
    pub layers: Vec<LayerGradients>,
}

impl NetworkGradients {
    pub fn zeros_like(net: &DenseNetwork) -> Self {
        Self {
            layers: net
                .layers
                .iter()
                .map(|l| LayerGradients {
                    weights: vec![vec![0.0; l.in_dim()]; l.out_dim()],
                    bias: vec![0.0; l.out_dim()],
                })
                .collect(),
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for layer in &mut self.layers {
            for row in &mut layer.weights {
                row.iter_mut().for_each(|g| *g *= factor);
            }
            layer.bias.iter_mut().for_each(|g| *g *= factor);
        }
    }

    pub fn norm(&self) -> f64 {
        let mut sq = 0.0;
        for layer in &self.layers {
            for row in &layer.weights {
                sq += row.iter().map(|g| g * g).sum::<f64>();
            }
            sq += layer.bias.iter().map(|g| g * g).sum::<f64>();
        }
        sq.sqrt()
    }

    /// Rescale so the global L2 norm does not exceed `max_norm`.
    pub fn clip_norm(&mut self, max_norm: f64) {
        let norm = self.norm();
        if norm.is_finite() && norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseNetwork {
    /// Expected input dimension.
    pub input_dim: usize,
    pub layers: Vec<DenseLayer>,
}

impl DenseNetwork {
    /// Build an MLP: hidden layers use `hidden_activation`, the final layer
    /// is linear.
    pub fn new<R: Rng>(
        input_dim: usize,
        hidden_dims: &[usize],
        output_dim: usize,
        hidden_activation: Activation,
        rng: &mut R,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden_dims.len() + 1);
        let mut in_dim = input_dim;
        for &h in hidden_dims {
            layers.push(DenseLayer::init(in_dim, h, hidden_activation, rng));
            in_dim = h;
        }
        layers.push(DenseLayer::init(in_dim, output_dim, Activation::Linear, rng));
        Self { input_dim, layers }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.input_dim == 0 {
            return Err("input_dim must be > 0".to_string());
        }
        if self.layers.is_empty() {
            return Err("layers must not be empty".to_string());
        }
        let mut expected_in = self.input_dim;
        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.out_dim() == 0 {
                return Err(format!("layer[{idx}] out_dim must be > 0"));
            }
            if layer.bias.len() != layer.out_dim() {
                return Err(format!(
                    "layer[{idx}] bias len {} != out_dim {}",
                    layer.bias.len(),
                    layer.out_dim()
                ));
            }
            for (r, row) in layer.weights.iter().enumerate() {
                if row.len() != expected_in {
                    return Err(format!(
                        "layer[{idx}] weights row {r} len {} != expected in_dim {expected_in}",
                        row.len()
                    ));
                }
                if row.iter().any(|v| !v.is_finite()) {
                    return Err(format!("layer[{idx}] weights contain non-finite values"));
                }
            }
            if layer.bias.iter().any(|v| !v.is_finite()) {
                return Err(format!("layer[{idx}] bias contain non-finite values"));
            }
            expected_in = layer.out_dim();
        }
        Ok(())
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map(|l| l.out_dim()).unwrap_or(0)
    }

    fn check_input(&self, input: &[f64]) -> Result<()> {
        if input.len() != self.input_dim {
            return Err(CoreError::dimension(
                "dense network input",
                self.input_dim,
                input.len(),
            ));
        }
        Ok(())
    }

    pub fn forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.check_input(input)?;
        let mut x = input.to_vec();
        for layer in &self.layers {
            x = layer
                .pre_activation(&x)
                .into_iter()
                .map(|v| layer.activation.apply(v))
                .collect();
        }
        Ok(x)
    }

    /// Forward pass that keeps what `backward` needs.
    pub fn forward_trace(&self, input: &[f64]) -> Result<ForwardTrace> {
        self.check_input(input)?;
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre = Vec::with_capacity(self.layers.len());
        let mut x = input.to_vec();
        for layer in &self.layers {
            let z = layer.pre_activation(&x);
            let a: Vec<f64> = z.iter().map(|v| layer.activation.apply(*v)).collect();
            inputs.push(std::mem::replace(&mut x, a));
            pre.push(z);
        }
        Ok(ForwardTrace {
            inputs,
            pre,
            output: x,
        })
    }

    /// Backpropagate `grad_output` (dL/d output), accumulating parameter
    /// gradients into `grads`. Returns dL/d input.
    pub fn backward(
        &self,
        trace: &ForwardTrace,
        grad_output: &[f64],
        grads: &mut NetworkGradients,
    ) -> Vec<f64> {
        let mut delta = grad_output.to_vec();
        for (idx, layer) in self.layers.iter().enumerate().rev() {
            let z = &trace.pre[idx];
            let x = &trace.inputs[idx];
            for (d, zi) in delta.iter_mut().zip(z) {
                *d *= layer.activation.derivative(*zi);
            }

            let lg = &mut grads.layers[idx];
            for (o, d) in delta.iter().enumerate() {
                if *d == 0.0 {
                    continue;
                }
                lg.bias[o] += d;
                for (g, xi) in lg.weights[o].iter_mut().zip(x) {
                    *g += d * xi;
                }
            }

            let mut grad_in = vec![0.0; layer.in_dim()];
            for (row, d) in layer.weights.iter().zip(&delta) {
                for (gi, w) in grad_in.iter_mut().zip(row) {
                    *gi += w * d;
                }
            }
            delta = grad_in;
        }
        delta
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.out_dim() * l.in_dim() + l.bias.len())
            .sum()
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// log(sum(exp(x))) without overflow.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}
