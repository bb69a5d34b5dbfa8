// Shared models for Hoopcast services
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

// ============================================================================
// Fixed dimensions
// ============================================================================

/// Dimensionality of a team's latent representation.
pub const LATENT_DIM: usize = 16;
/// Length of the per-team, per-game normalized feature vector.
pub const FEATURE_DIM: usize = 80;
/// Number of possession-outcome classes.
pub const NUM_OUTCOMES: usize = 8;
/// Length of the game-context block fed to the outcome model.
pub const CONTEXT_DIM: usize = 10;
/// Outcome label vectors must sum to 1 within this tolerance.
pub const LABEL_SUM_TOLERANCE: f64 = 1e-6;
/// Most recent applied game ids kept on a posterior.
pub const RECENT_GAME_IDS: usize = 64;

pub type LatentVector = [f64; LATENT_DIM];
pub type OutcomeProbs = [f64; NUM_OUTCOMES];

// ============================================================================
// Possession outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    TwoPointMake,
    TwoPointMiss,
    ThreePointMake,
    ThreePointMiss,
    FreeThrowMake,
    FreeThrowMiss,
    OffensiveRebound,
    Turnover,
}

impl OutcomeClass {
    /// Label order used by every outcome vector in the system.
    pub const ALL: [OutcomeClass; NUM_OUTCOMES] = [
        OutcomeClass::TwoPointMake,
        OutcomeClass::TwoPointMiss,
        OutcomeClass::ThreePointMake,
        OutcomeClass::ThreePointMiss,
        OutcomeClass::FreeThrowMake,
        OutcomeClass::FreeThrowMiss,
        OutcomeClass::OffensiveRebound,
        OutcomeClass::Turnover,
    ];

    pub fn index(&self) -> usize {
        match self {
            OutcomeClass::TwoPointMake => 0,
            OutcomeClass::TwoPointMiss => 1,
            OutcomeClass::ThreePointMake => 2,
            OutcomeClass::ThreePointMiss => 3,
            OutcomeClass::FreeThrowMake => 4,
            OutcomeClass::FreeThrowMiss => 5,
            OutcomeClass::OffensiveRebound => 6,
            OutcomeClass::Turnover => 7,
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    pub fn points(&self) -> u32 {
        match self {
            OutcomeClass::TwoPointMake => 2,
            OutcomeClass::ThreePointMake => 3,
            OutcomeClass::FreeThrowMake => 1,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::TwoPointMake => "2pt_make",
            OutcomeClass::TwoPointMiss => "2pt_miss",
            OutcomeClass::ThreePointMake => "3pt_make",
            OutcomeClass::ThreePointMiss => "3pt_miss",
            OutcomeClass::FreeThrowMake => "ft_make",
            OutcomeClass::FreeThrowMiss => "ft_miss",
            OutcomeClass::OffensiveRebound => "oreb",
            OutcomeClass::Turnover => "turnover",
        }
    }
}

/// Validate an 8-way outcome label and bring it onto the simplex.
///
/// Vectors already within tolerance are returned untouched. Vectors with
/// small drift are renormalized; negative, non-finite or all-zero vectors
/// are rejected.
pub fn normalize_outcome_probs(probs: &[f64]) -> Result<OutcomeProbs> {
    if probs.len() != NUM_OUTCOMES {
        return Err(CoreError::dimension("outcome label", NUM_OUTCOMES, probs.len()));
    }
    if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(CoreError::InvalidLabel(format!(
            "entries must be finite and non-negative: {:?}",
            probs
        )));
    }
    let sum: f64 = probs.iter().sum();
    if sum <= 0.0 {
        return Err(CoreError::InvalidLabel("label sums to zero".to_string()));
    }

    let mut out = [0.0; NUM_OUTCOMES];
    if (sum - 1.0).abs() <= LABEL_SUM_TOLERANCE {
        out.copy_from_slice(probs);
    } else {
        for (o, p) in out.iter_mut().zip(probs) {
            *o = p / sum;
        }
    }
    Ok(out)
}

/// Pad (with zeros) a feature vector to the fixed input length.
pub fn fit_feature_vector(features: &[f64]) -> Result<Vec<f64>> {
    if features.len() > FEATURE_DIM {
        return Err(CoreError::dimension("feature vector", FEATURE_DIM, features.len()));
    }
    let mut out = vec![0.0; FEATURE_DIM];
    for (o, f) in out.iter_mut().zip(features) {
        *o = if f.is_finite() { *f } else { 0.0 };
    }
    Ok(out)
}

// ============================================================================
// Team posterior
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonTransitionRecord {
    pub from_season: String,
    pub to_season: String,
    pub transition_date: NaiveDate,
    pub variance_added: f64,
}

/// A team's current Gaussian belief over its latent representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamPosterior {
    pub team_id: String,
    pub mu: LatentVector,
    pub sigma: LatentVector,
    pub games_processed: u32,
    pub confidence: f64,
    pub last_season: String,
    pub last_updated: DateTime<Utc>,
    pub transition_history: Vec<SeasonTransitionRecord>,
    /// Games already folded into this posterior, oldest first.
    #[serde(default)]
    pub recent_game_ids: Vec<String>,
}

impl TeamPosterior {
    /// Default prior for a team seen for the first time.
    pub fn new_default(team_id: &str, initial_uncertainty: f64, now: DateTime<Utc>) -> Self {
        Self {
            team_id: team_id.to_string(),
            mu: [0.0; LATENT_DIM],
            sigma: [initial_uncertainty; LATENT_DIM],
            games_processed: 0,
            confidence: 0.0,
            last_season: String::new(),
            last_updated: now,
            transition_history: Vec::new(),
            recent_game_ids: Vec::new(),
        }
    }

    pub fn has_applied(&self, game_id: &str) -> bool {
        self.recent_game_ids.iter().any(|id| id == game_id)
    }

    /// Remember `game_id` as applied, keeping the newest [`RECENT_GAME_IDS`].
    pub fn record_game(&mut self, game_id: &str) {
        if self.has_applied(game_id) {
            return;
        }
        self.recent_game_ids.push(game_id.to_string());
        if self.recent_game_ids.len() > RECENT_GAME_IDS {
            let excess = self.recent_game_ids.len() - RECENT_GAME_IDS;
            self.recent_game_ids.drain(..excess);
        }
    }

    pub fn variance(&self) -> LatentVector {
        let mut var = [0.0; LATENT_DIM];
        for (v, s) in var.iter_mut().zip(self.sigma.iter()) {
            *v = s * s;
        }
        var
    }

    /// Scalar strength summary used by the opponent-strength heuristics.
    pub fn strength(&self) -> f64 {
        self.mu.iter().sum::<f64>() / LATENT_DIM as f64
    }

    pub fn mean_sigma(&self) -> f64 {
        self.sigma.iter().sum::<f64>() / LATENT_DIM as f64
    }

    /// Structural check: finite means, strictly positive finite sigmas.
    pub fn check_structure(&self) -> std::result::Result<(), String> {
        if self.mu.iter().any(|m| !m.is_finite()) {
            return Err("mu contains non-finite values".to_string());
        }
        if self.sigma.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err("sigma must be finite and > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        Ok(())
    }
}

// ============================================================================
// Games
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamSide {
    Home,
    Away,
}

impl TeamSide {
    pub fn opposite(&self) -> Self {
        match self {
            TeamSide::Home => TeamSide::Away,
            TeamSide::Away => TeamSide::Home,
        }
    }
}

/// Observed per-team outcome distributions for a completed game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameLabel {
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub transition_probs_home: OutcomeProbs,
    pub transition_probs_away: OutcomeProbs,
    pub game_date: NaiveDate,
    pub processed: bool,
    #[serde(default)]
    pub home_score: Option<u16>,
    #[serde(default)]
    pub away_score: Option<u16>,
}

impl GameLabel {
    pub fn team_id(&self, side: TeamSide) -> &str {
        match side {
            TeamSide::Home => &self.home_team_id,
            TeamSide::Away => &self.away_team_id,
        }
    }

    pub fn probs(&self, side: TeamSide) -> &OutcomeProbs {
        match side {
            TeamSide::Home => &self.transition_probs_home,
            TeamSide::Away => &self.transition_probs_away,
        }
    }

    /// Final margin from `side`'s perspective, when the score is known.
    pub fn margin(&self, side: TeamSide) -> Option<f64> {
        let (home, away) = (self.home_score?, self.away_score?);
        let home_margin = home as f64 - away as f64;
        Some(match side {
            TeamSide::Home => home_margin,
            TeamSide::Away => -home_margin,
        })
    }
}

/// Situational context for a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameContext {
    pub neutral_site: bool,
    pub conference_game: bool,
    pub postseason: bool,
    pub home_rest_days: Option<u32>,
    pub away_rest_days: Option<u32>,
    /// Possessions per team expected for the game.
    pub expected_possessions: f64,
    /// Fraction of the regular season elapsed, 0-1.
    pub season_progress: f64,
}

impl Default for GameContext {
    fn default() -> Self {
        Self {
            neutral_site: false,
            conference_game: true,
            postseason: false,
            home_rest_days: None,
            away_rest_days: None,
            expected_possessions: 70.0,
            season_progress: 0.5,
        }
    }
}

impl GameContext {
    pub fn rest_days(&self, side: TeamSide) -> Option<u32> {
        match side {
            TeamSide::Home => self.home_rest_days,
            TeamSide::Away => self.away_rest_days,
        }
    }

    /// Encode the context from one team's perspective.
    ///
    /// Layout: [is_home, neutral, conference, postseason, own rest, opp rest,
    /// own short rest, opp short rest, pace, season progress].
    pub fn to_vector(&self, side: TeamSide) -> [f64; CONTEXT_DIM] {
        let is_home = side == TeamSide::Home && !self.neutral_site;
        let own_rest = self.rest_days(side);
        let opp_rest = self.rest_days(side.opposite());
        let rest_feature = |r: Option<u32>| r.map(|d| (d.min(7) as f64) / 7.0).unwrap_or(0.5);
        let short_rest = |r: Option<u32>| match r {
            Some(d) if d < 2 => 1.0,
            _ => 0.0,
        };
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        [
            flag(is_home),
            flag(self.neutral_site),
            flag(self.conference_game),
            flag(self.postseason),
            rest_feature(own_rest),
            rest_feature(opp_rest),
            short_rest(own_rest),
            short_rest(opp_rest),
            self.expected_possessions / 100.0,
            self.season_progress.clamp(0.0, 1.0),
        ]
    }
}

/// A completed game as supplied by the feature-extraction collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub label: GameLabel,
    pub home_features: Vec<f64>,
    pub away_features: Vec<f64>,
    pub context: GameContext,
}

impl GameRecord {
    pub fn features(&self, side: TeamSide) -> &[f64] {
        match side {
            TeamSide::Home => &self.home_features,
            TeamSide::Away => &self.away_features,
        }
    }
}

// ============================================================================
// Betting markets
// ============================================================================

/// Market odds for one game. Prices are American odds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BettingOdds {
    pub home_moneyline: Option<i32>,
    pub away_moneyline: Option<i32>,
    /// Home-team spread, e.g. -5.5 when home is favored.
    pub spread_line: Option<f64>,
    pub home_spread_odds: Option<i32>,
    pub away_spread_odds: Option<i32>,
    pub total_line: Option<f64>,
    pub over_odds: Option<i32>,
    pub under_odds: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Moneyline,
    Spread,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetSide {
    Home,
    Away,
    Over,
    Under,
}

/// An upcoming game to price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpcomingGame {
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub game_date: NaiveDate,
    pub context: GameContext,
    pub odds: BettingOdds,
}
