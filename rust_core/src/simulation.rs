//! Monte Carlo game simulation.
//!
//! Each trial plays a full game possession by possession, drawing every
//! possession's outcome from the offense's 8-way distribution. Trials run
//! in fixed-size chunks across the rayon pool; chunk `k` always uses the
//! RNG seeded from `(seed, k)`, so a given seed reproduces the same result
//! regardless of thread count.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SimulationConfig;
use crate::error::{CoreError, Result};
use crate::models::{normalize_outcome_probs, OutcomeClass, OutcomeProbs, TeamSide};

/// Per-chunk seed spacing (golden-ratio increment).
const CHUNK_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PossessionOrder {
    /// Teams take turns until both budgets are spent.
    #[default]
    Alternating,
    /// Each possession goes to a team with probability proportional to its
    /// possession budget.
    PaceWeighted,
}

/// What to simulate.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationInput {
    pub home_probs: OutcomeProbs,
    pub away_probs: OutcomeProbs,
    pub home_possessions: f64,
    pub away_possessions: f64,
    pub home_court_advantage: f64,
}

impl SimulationInput {
    /// Same possession count for both teams.
    pub fn symmetric(home: OutcomeProbs, away: OutcomeProbs, possessions: f64, hca: f64) -> Self {
        Self {
            home_probs: home,
            away_probs: away,
            home_possessions: possessions,
            away_possessions: possessions,
            home_court_advantage: hca,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub n_simulations: usize,
    pub seed: u64,
    pub home_court_advantage: f64,
    pub home_win_prob: f64,
    pub away_win_prob: f64,
    pub tie_prob: f64,
    /// Mean of home − away + home-court advantage.
    pub mean_margin: f64,
    pub margin_variance: f64,
    pub mean_home_score: f64,
    pub mean_away_score: f64,
    pub mean_total: f64,
    /// Per-trial final scores, trial order.
    pub home_scores: Vec<u16>,
    pub away_scores: Vec<u16>,
}

impl SimulationResult {
    fn from_scores(scores: Vec<(u16, u16)>, seed: u64, hca: f64) -> Self {
        let n = scores.len();
        let nf = n.max(1) as f64;
        let (mut home_wins, mut away_wins, mut ties) = (0usize, 0usize, 0usize);
        let (mut sum_margin, mut sum_margin_sq) = (0.0, 0.0);
        let (mut sum_home, mut sum_away) = (0.0, 0.0);
        for &(h, a) in &scores {
            let margin = h as f64 - a as f64 + hca;
            if margin > 0.0 {
                home_wins += 1;
            } else if margin < 0.0 {
                away_wins += 1;
            } else {
                ties += 1;
            }
            sum_margin += margin;
            sum_margin_sq += margin * margin;
            sum_home += h as f64;
            sum_away += a as f64;
        }
        let mean_margin = sum_margin / nf;
        let (home_scores, away_scores) = scores.into_iter().unzip();
        Self {
            n_simulations: n,
            seed,
            home_court_advantage: hca,
            home_win_prob: home_wins as f64 / nf,
            away_win_prob: away_wins as f64 / nf,
            tie_prob: ties as f64 / nf,
            mean_margin,
            margin_variance: (sum_margin_sq / nf - mean_margin * mean_margin).max(0.0),
            mean_home_score: sum_home / nf,
            mean_away_score: sum_away / nf,
            mean_total: (sum_home + sum_away) / nf,
            home_scores,
            away_scores,
        }
    }

    fn fraction(&self, pred: impl Fn(u16, u16) -> bool) -> f64 {
        if self.n_simulations == 0 {
            return 0.0;
        }
        let hits = self
            .home_scores
            .iter()
            .zip(&self.away_scores)
            .filter(|(h, a)| pred(**h, **a))
            .count();
        hits as f64 / self.n_simulations as f64
    }

    /// P(home covers `spread_line`), e.g. -5.5 when home is favored.
    pub fn prob_home_cover(&self, spread_line: f64) -> f64 {
        let hca = self.home_court_advantage;
        self.fraction(|h, a| h as f64 - a as f64 + hca + spread_line > 0.0)
    }

    pub fn prob_away_cover(&self, spread_line: f64) -> f64 {
        let hca = self.home_court_advantage;
        self.fraction(|h, a| h as f64 - a as f64 + hca + spread_line < 0.0)
    }

    pub fn prob_over(&self, total_line: f64) -> f64 {
        self.fraction(|h, a| (h as f64 + a as f64) > total_line)
    }

    pub fn prob_under(&self, total_line: f64) -> f64 {
        self.fraction(|h, a| (h as f64 + a as f64) < total_line)
    }

    /// Empirical score distribution for one side.
    pub fn score_distribution(&self, side: TeamSide) -> BTreeMap<u16, f64> {
        let scores = match side {
            TeamSide::Home => &self.home_scores,
            TeamSide::Away => &self.away_scores,
        };
        let mut counts: BTreeMap<u16, f64> = BTreeMap::new();
        for s in scores {
            *counts.entry(*s).or_default() += 1.0;
        }
        let n = scores.len().max(1) as f64;
        counts.values_mut().for_each(|c| *c /= n);
        counts
    }
}

/// Outcome of a two-seed agreement check.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub first_seed: u64,
    pub second_seed: u64,
    pub first_home_win: f64,
    pub second_home_win: f64,
    pub difference: f64,
}

#[derive(Debug, Clone)]
pub struct MonteCarloGameSimulator {
    config: SimulationConfig,
    order: PossessionOrder,
}

impl MonteCarloGameSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            order: PossessionOrder::default(),
        }
    }

    pub fn with_order(mut self, order: PossessionOrder) -> Self {
        self.order = order;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn simulate(&self, input: &SimulationInput) -> Result<SimulationResult> {
        self.simulate_with_seed(input, self.config.seed)
    }

    pub fn simulate_with_seed(
        &self,
        input: &SimulationInput,
        seed: u64,
    ) -> Result<SimulationResult> {
        let home = sampler(&input.home_probs, "home")?;
        let away = sampler(&input.away_probs, "away")?;
        let home_budget = possession_budget(input.home_possessions)?;
        let away_budget = possession_budget(input.away_possessions)?;

        let n = self.config.n_simulations;
        let chunk = self.config.chunk_size.max(1);
        let n_chunks = n.div_ceil(chunk);
        let order = self.order;

        let scores: Vec<(u16, u16)> = (0..n_chunks)
            .into_par_iter()
            .map(|c| {
                let chunk_seed = seed ^ (c as u64).wrapping_mul(CHUNK_SEED_STRIDE);
                let mut rng = StdRng::seed_from_u64(chunk_seed);
                let trials = chunk.min(n - c * chunk);
                (0..trials)
                    .map(|_| play_game(&home, &away, home_budget, away_budget, order, &mut rng))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        let result = SimulationResult::from_scores(scores, seed, input.home_court_advantage);
        debug!(
            n = result.n_simulations,
            seed,
            home_win = result.home_win_prob,
            mean_margin = result.mean_margin,
            "Simulation complete"
        );
        Ok(result)
    }

    /// Run with two seeds and compare home-win probabilities.
    ///
    /// Returns `SimulationDivergence` when the gap exceeds the configured
    /// tolerance; callers treat that as a warning.
    pub fn check_convergence(&self, input: &SimulationInput) -> Result<ConvergenceReport> {
        let first_seed = self.config.seed;
        let second_seed = self.config.seed.wrapping_add(1);
        let first = self.simulate_with_seed(input, first_seed)?;
        let second = self.simulate_with_seed(input, second_seed)?;
        let difference = (first.home_win_prob - second.home_win_prob).abs();
        if difference > self.config.divergence_tolerance {
            warn!(
                first = first.home_win_prob,
                second = second.home_win_prob,
                tolerance = self.config.divergence_tolerance,
                "Simulation seeds disagree"
            );
            return Err(CoreError::SimulationDivergence {
                first: first.home_win_prob,
                second: second.home_win_prob,
                tolerance: self.config.divergence_tolerance,
            });
        }
        Ok(ConvergenceReport {
            first_seed,
            second_seed,
            first_home_win: first.home_win_prob,
            second_home_win: second.home_win_prob,
            difference,
        })
    }
}

fn sampler(probs: &OutcomeProbs, side: &str) -> Result<WeightedIndex<f64>> {
    let probs = normalize_outcome_probs(probs)
        .map_err(|e| CoreError::InvalidLabel(format!("{side} outcome distribution: {e}")))?;
    WeightedIndex::new(probs.iter().copied())
        .map_err(|e| CoreError::InvalidLabel(format!("{side} outcome distribution: {e}")))
}

fn possession_budget(possessions: f64) -> Result<u32> {
    if !possessions.is_finite() || possessions < 1.0 {
        return Err(CoreError::InvalidConfig(format!(
            "possession count must be >= 1, got {possessions}"
        )));
    }
    Ok(possessions.round() as u32)
}

fn points(dist: &WeightedIndex<f64>, rng: &mut StdRng) -> u16 {
    let idx = dist.sample(rng);
    OutcomeClass::from_index(idx).map(|c| c.points() as u16).unwrap_or(0)
}

fn play_game(
    home: &WeightedIndex<f64>,
    away: &WeightedIndex<f64>,
    home_budget: u32,
    away_budget: u32,
    order: PossessionOrder,
    rng: &mut StdRng,
) -> (u16, u16) {
    let (mut home_left, mut away_left) = (home_budget, away_budget);
    let (mut home_score, mut away_score) = (0u16, 0u16);
    let mut home_ball = true;

    while home_left > 0 || away_left > 0 {
        let home_offense = match order {
            PossessionOrder::Alternating => {
                let pick = if home_left == 0 {
                    false
                } else if away_left == 0 {
                    true
                } else {
                    home_ball
                };
                home_ball = !pick;
                pick
            }
            PossessionOrder::PaceWeighted => {
                let total = (home_left + away_left) as f64;
                rng.gen::<f64>() < home_left as f64 / total
            }
        };
        if home_offense {
            home_score = home_score.saturating_add(points(home, rng));
            home_left -= 1;
        } else {
            away_score = away_score.saturating_add(points(away, rng));
            away_left -= 1;
        }
    }
    (home_score, away_score)
}
