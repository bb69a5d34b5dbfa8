//! Adam optimizer over [`DenseNetwork`] parameters.

use serde::{Deserialize, Serialize};

use super::dense::{DenseNetwork, NetworkGradients};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    step: u64,
    /// First/second moments, shaped [layer][out][in + 1]; the last column is the bias.
    m: Vec<Vec<Vec<f64>>>,
    v: Vec<Vec<Vec<f64>>>,
}

impl Adam {
    pub fn new(net: &DenseNetwork, learning_rate: f64) -> Self {
        let zeros: Vec<Vec<Vec<f64>>> = net
            .layers
            .iter()
            .map(|l| vec![vec![0.0; l.in_dim() + 1]; l.out_dim()])
            .collect();
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            m: zeros.clone(),
            v: zeros,
        }
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Apply one descent step using averaged gradients.
    pub fn step(&mut self, net: &mut DenseNetwork, grads: &NetworkGradients) {
        self.step += 1;
        let t = self.step as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);

        for (l, (layer, lg)) in net.layers.iter_mut().zip(&grads.layers).enumerate() {
            let in_dim = layer.in_dim();
            for o in 0..layer.out_dim() {
                for i in 0..=in_dim {
                    let g = if i < in_dim { lg.weights[o][i] } else { lg.bias[o] };
                    if !g.is_finite() {
                        continue;
                    }
                    let m = &mut self.m[l][o][i];
                    let v = &mut self.v[l][o][i];
                    *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                    *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                    let update =
                        self.learning_rate * (*m / bc1) / ((*v / bc2).sqrt() + self.epsilon);
                    if i < in_dim {
                        layer.weights[o][i] -= update;
                    } else {
                        layer.bias[o] -= update;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::dense::Activation;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_adam_reduces_squared_error() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut net = DenseNetwork::new(2, &[8], 1, Activation::Relu, &mut rng);
        let mut opt = Adam::new(&net, 0.01);
        let data = [([0.0, 1.0], 1.0), ([1.0, 0.0], -1.0), ([1.0, 1.0], 0.0)];

        let loss = |net: &DenseNetwork| -> f64 {
            data.iter()
                .map(|(x, y)| (net.forward(x).unwrap()[0] - y).powi(2))
                .sum()
        };
        let before = loss(&net);

        for _ in 0..300 {
            let mut grads = NetworkGradients::zeros_like(&net);
            for (x, y) in &data {
                let trace = net.forward_trace(x).unwrap();
                let err = trace.output[0] - y;
                net.backward(&trace, &[2.0 * err], &mut grads);
            }
            grads.scale(1.0 / data.len() as f64);
            opt.step(&mut net, &grads);
        }

        assert!(loss(&net) < before * 0.1);
        assert_eq!(opt.steps(), 300);
    }
}
