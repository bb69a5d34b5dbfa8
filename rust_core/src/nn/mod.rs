//! Lightweight neural network utilities.
//!
//! Dependency-light dense layers with manual backpropagation, shared by the
//! contrastive encoder and the outcome transition model.

pub mod dense;
pub mod optim;

pub use dense::{
    log_sum_exp, softmax, Activation, DenseLayer, DenseNetwork, ForwardTrace, NetworkGradients,
};
pub use optim::Adam;
