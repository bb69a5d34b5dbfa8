//! Observation-uncertainty policy and posterior confidence.

use crate::config::{BayesianConfig, SurprisePolicy};
use crate::models::{GameContext, TeamPosterior, TeamSide};

/// `threshold · (1 − e^(−3n / maxGames))`; approaches but never reaches the threshold.
pub fn confidence(games_processed: u32, config: &BayesianConfig) -> f64 {
    let n = games_processed as f64;
    config.confidence_threshold * (1.0 - (-3.0 * n / config.max_games_for_convergence).exp())
}

/// Base observation σ after `games_processed` games, floored at the minimum.
pub fn base_observation_sigma(games_processed: u32, config: &BayesianConfig) -> f64 {
    let decayed = config.base_observation_uncertainty
        * config.observation_decay.powi(games_processed.min(i32::MAX as u32) as i32);
    decayed.max(config.min_uncertainty)
}

/// Product of the situational multipliers for `side`.
pub fn context_factor(context: &GameContext, side: TeamSide, config: &BayesianConfig) -> f64 {
    let mut factor = 1.0;
    if context.neutral_site {
        factor *= config.neutral_site_factor;
    }
    if !context.conference_game {
        factor *= config.non_conference_factor;
    }
    if matches!(context.rest_days(side), Some(d) if d < 2) {
        factor *= config.short_rest_factor;
    }
    if context.postseason {
        factor *= config.postseason_factor;
    }
    factor
}

/// Multiplier from how far the result strayed from what the opponent's
/// known strength predicted. Unknown score means no adjustment.
pub fn surprise_multiplier(
    team: &TeamPosterior,
    opponent: &TeamPosterior,
    actual_margin: Option<f64>,
    policy: &SurprisePolicy,
) -> f64 {
    let Some(actual) = actual_margin else {
        return 1.0;
    };
    let expected = (team.strength() - opponent.strength()) * policy.margin_per_strength;
    let z = (actual - expected).abs() / policy.surprise_scale;

    let multiplier = if z > 1.0 {
        1.0 + policy.weight * (z - 1.0)
    } else {
        // Unsurprising results count for more when the opponent is well known
        1.0 - policy.weight * opponent.confidence * (1.0 - z)
    };
    multiplier.clamp(policy.min_multiplier, policy.max_multiplier)
}

/// Direct μ shift for the opponent-strength post-adjustment.
///
/// Wins over strong opponents shift up more; losses to weak opponents shift
/// down more. Bounded by `max_opponent_adjustment`.
pub fn opponent_adjustment(
    actual_margin: Option<f64>,
    opponent: &TeamPosterior,
    config: &BayesianConfig,
    policy: &SurprisePolicy,
) -> f64 {
    let Some(margin) = actual_margin else {
        return 0.0;
    };
    let result = (margin / policy.surprise_scale).tanh();
    let opp_strength = opponent.strength().tanh();
    let factor = if result >= 0.0 {
        1.0 + opp_strength
    } else {
        1.0 - opp_strength
    };
    (config.opponent_adjustment_rate * result * factor)
        .clamp(-config.max_opponent_adjustment, config.max_opponent_adjustment)
}
