//! Sequential Bayesian inference over team latent vectors.

pub mod uncertainty;
pub mod updater;

pub use uncertainty::{confidence, surprise_multiplier};
pub use updater::{conjugate_update, Observation, ObservationUncertainty, SequentialBayesianUpdater};
