//! Sequential game processing and game prediction.
//!
//! Processing walks completed games in date order. For each game both
//! teams' posteriors are loaded, run through the season step, scored by
//! the outcome model, turned into observations and updated. Both
//! posteriors are written in one atomic save; the outcome model step is
//! only kept once that save succeeds. Nothing here ever mutates the
//! encoder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bayes::{ObservationUncertainty, SequentialBayesianUpdater};
use crate::config::{PipelineConfig, RetryConfig};
use crate::encoder::{FrozenEncoder, PretrainingSample};
use crate::error::{CoreError, Result};
use crate::ev::{ExpectedValueCalculator, MarketEvaluation};
use crate::models::{
    fit_feature_vector, normalize_outcome_probs, GameRecord, OutcomeProbs, TeamPosterior,
    TeamSide, UpcomingGame,
};
use crate::outcome::{build_input, cross_entropy, OutcomeExample, OutcomeTransitionModel};
use crate::posterior::PosteriorStore;
use crate::retry::execute_with_retry;
use crate::weights::ModelCheckpoint;
use crate::season::{SeasonCheck, SeasonTransitionManager};
use crate::simulation::{MonteCarloGameSimulator, SimulationInput, SimulationResult};

/// Unprocessed games for one session.
#[derive(Debug, Default)]
pub struct UnprocessedGames {
    pub games: Vec<GameRecord>,
    /// Rows that could not be decoded into a game.
    pub rejected: Vec<GameFailure>,
}

/// Supplier of completed and upcoming games.
#[async_trait]
pub trait GameSource: Send + Sync {
    /// Unprocessed, non-quarantined completed games, oldest first.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<UnprocessedGames>;

    /// Flip `processed` to true. Returns false if it already was.
    async fn mark_processed(&self, game_id: &str) -> Result<bool>;

    /// Quarantine a game that can never be applied so later fetches skip it.
    async fn mark_failed(&self, game_id: &str, reason: &str) -> Result<()>;

    async fn fetch_upcoming(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<UpcomingGame>>;

    async fn fetch_training_samples(&self, limit: usize) -> Result<Vec<PretrainingSample>>;
}

/// Process-local game source for tests and offline runs.
#[derive(Debug, Default)]
pub struct InMemoryGameSource {
    games: RwLock<Vec<GameRecord>>,
    unreadable: RwLock<Vec<GameFailure>>,
    quarantined: RwLock<HashMap<String, String>>,
    upcoming: RwLock<Vec<UpcomingGame>>,
    failing_marks: AtomicUsize,
}

impl InMemoryGameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_game(&self, game: GameRecord) {
        self.games.write().push(game);
    }

    /// A stored row that does not decode into a game.
    pub fn add_unreadable(&self, game_id: &str, error: &str) {
        self.unreadable.write().push(GameFailure {
            game_id: game_id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn add_upcoming(&self, game: UpcomingGame) {
        self.upcoming.write().push(game);
    }

    pub fn is_processed(&self, game_id: &str) -> Option<bool> {
        self.games
            .read()
            .iter()
            .find(|g| g.label.game_id == game_id)
            .map(|g| g.label.processed)
    }

    pub fn failure_reason(&self, game_id: &str) -> Option<String> {
        self.quarantined.read().get(game_id).cloned()
    }

    /// Make the next `count` `mark_processed` calls fail transiently.
    pub fn fail_next_marks(&self, count: usize) {
        self.failing_marks.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl GameSource for InMemoryGameSource {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<UnprocessedGames> {
        let quarantined = self.quarantined.read();
        let mut games: Vec<GameRecord> = self
            .games
            .read()
            .iter()
            .filter(|g| !g.label.processed && !quarantined.contains_key(&g.label.game_id))
            .cloned()
            .collect();
        games.sort_by(|a, b| {
            (a.label.game_date, &a.label.game_id).cmp(&(b.label.game_date, &b.label.game_id))
        });
        games.truncate(limit);
        let rejected = self
            .unreadable
            .read()
            .iter()
            .filter(|r| !quarantined.contains_key(&r.game_id))
            .cloned()
            .collect();
        Ok(UnprocessedGames { games, rejected })
    }

    async fn mark_processed(&self, game_id: &str) -> Result<bool> {
        let injected = self
            .failing_marks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoreError::Storage("connection timed out".to_string()));
        }
        let mut games = self.games.write();
        match games.iter_mut().find(|g| g.label.game_id == game_id) {
            Some(g) if !g.label.processed => {
                g.label.processed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, game_id: &str, reason: &str) -> Result<()> {
        self.quarantined
            .write()
            .insert(game_id.to_string(), reason.to_string());
        Ok(())
    }

    async fn fetch_upcoming(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<UpcomingGame>> {
        let mut games: Vec<UpcomingGame> = self
            .upcoming
            .read()
            .iter()
            .filter(|g| g.game_date >= from && g.game_date <= to)
            .cloned()
            .collect();
        games.sort_by(|a, b| (a.game_date, &a.game_id).cmp(&(b.game_date, &b.game_id)));
        Ok(games)
    }

    async fn fetch_training_samples(&self, limit: usize) -> Result<Vec<PretrainingSample>> {
        Ok(self
            .games
            .read()
            .iter()
            .take(limit)
            .flat_map(PretrainingSample::from_record)
            .collect())
    }
}

// ============================================================================
// Reports
// ============================================================================

/// What one game did to one team.
#[derive(Debug, Clone, Serialize)]
pub struct TeamUpdateReport {
    pub team_id: String,
    pub games_processed: u32,
    /// L2 norm of μ_post − μ_prior (prior taken before the season step).
    pub mu_shift: f64,
    pub mean_sigma_before: f64,
    pub mean_sigma_after: f64,
    pub confidence: f64,
    /// Cross-entropy of the pre-update prediction against the actual label.
    pub cross_entropy: f64,
    pub observation: ObservationUncertainty,
    pub observation_weight: f64,
    pub opponent_shift: f64,
    pub season_transition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameReport {
    pub game_id: String,
    pub game_date: NaiveDate,
    pub home: TeamUpdateReport,
    pub away: TeamUpdateReport,
    /// Mean outcome-model loss of this game's training step.
    pub model_loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameFailure {
    pub game_id: String,
    pub error: String,
}

/// End-of-session summary of a processing batch.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub games_seen: usize,
    pub games_processed: usize,
    pub games_skipped: usize,
    /// Games found already applied to both posteriors and only marked.
    pub games_recovered: usize,
    /// Games that can never be applied; also listed in `failures`.
    pub games_quarantined: usize,
    pub reports: Vec<GameReport>,
    pub failures: Vec<GameFailure>,
}

impl ProcessingSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            games_seen: 0,
            games_processed: 0,
            games_skipped: 0,
            games_recovered: 0,
            games_quarantined: 0,
            reports: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn mean_cross_entropy(&self) -> Option<f64> {
        if self.reports.is_empty() {
            return None;
        }
        let total: f64 = self
            .reports
            .iter()
            .map(|r| r.home.cross_entropy + r.away.cross_entropy)
            .sum();
        Some(total / (2 * self.reports.len()) as f64)
    }

    pub fn log_summary(&self) {
        info!(
            session_id = %self.session_id,
            seen = self.games_seen,
            processed = self.games_processed,
            skipped = self.games_skipped,
            recovered = self.games_recovered,
            quarantined = self.games_quarantined,
            failed = self.failures.len(),
            mean_cross_entropy = self.mean_cross_entropy().unwrap_or(f64::NAN),
            "Processing session finished"
        );
        for failure in &self.failures {
            warn!(game_id = %failure.game_id, error = %failure.error, "Game failed");
        }
    }
}

/// Simulation figures carried into a prediction report.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub n_simulations: usize,
    pub home_win_prob: f64,
    pub away_win_prob: f64,
    pub tie_prob: f64,
    pub mean_margin: f64,
    pub margin_std: f64,
    pub mean_home_score: f64,
    pub mean_away_score: f64,
    pub mean_total: f64,
}

impl From<&SimulationResult> for SimulationSummary {
    fn from(r: &SimulationResult) -> Self {
        Self {
            n_simulations: r.n_simulations,
            home_win_prob: r.home_win_prob,
            away_win_prob: r.away_win_prob,
            tie_prob: r.tie_prob,
            mean_margin: r.mean_margin,
            margin_std: r.margin_variance.sqrt(),
            mean_home_score: r.mean_home_score,
            mean_away_score: r.mean_away_score,
            mean_total: r.mean_total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub game_date: NaiveDate,
    pub home_outcome_probs: OutcomeProbs,
    pub away_outcome_probs: OutcomeProbs,
    pub simulation: SimulationSummary,
    /// Set when two seeds disagreed beyond tolerance.
    pub convergence_warning: Option<String>,
    pub opportunities: Vec<MarketEvaluation>,
    /// Lower of the two teams' posterior confidences.
    pub confidence: f64,
    pub home_games_processed: u32,
    pub away_games_processed: u32,
}

// ============================================================================
// Processor
// ============================================================================

/// What applying one game did.
#[derive(Debug, Clone)]
pub enum GameOutcome {
    Applied(GameReport),
    /// Both posteriors already carry the game; nothing was written.
    AlreadyApplied,
}

/// Labels and features of a game that passed validation.
struct ValidatedGame {
    home_label: OutcomeProbs,
    away_label: OutcomeProbs,
    home_features: Vec<f64>,
    away_features: Vec<f64>,
}

impl ValidatedGame {
    /// Checks that depend only on the game itself. A game failing them can
    /// never be applied.
    fn from_record(game: &GameRecord) -> Result<Self> {
        let label = &game.label;
        if label.home_team_id == label.away_team_id {
            return Err(CoreError::InvalidLabel(format!(
                "game {} has the same team on both sides",
                label.game_id
            )));
        }
        Ok(Self {
            home_label: normalize_outcome_probs(&label.transition_probs_home)?,
            away_label: normalize_outcome_probs(&label.transition_probs_away)?,
            home_features: fit_feature_vector(&game.home_features)?,
            away_features: fit_feature_vector(&game.away_features)?,
        })
    }
}

/// Per-team state after the season step.
struct SeasonedPrior {
    posterior: TeamPosterior,
    weight: f64,
    transition: Option<String>,
}

/// Runs games through the update chain one at a time.
pub struct SequentialProcessor {
    encoder: FrozenEncoder,
    outcome_model: OutcomeTransitionModel,
    store: PosteriorStore,
    updater: SequentialBayesianUpdater,
    seasons: SeasonTransitionManager,
    simulator: MonteCarloGameSimulator,
    ev: ExpectedValueCalculator,
    retry: RetryConfig,
    check_convergence: bool,
    checkpoint: Option<Arc<dyn ModelCheckpoint>>,
}

impl SequentialProcessor {
    pub fn new(
        config: &PipelineConfig,
        encoder: FrozenEncoder,
        outcome_model: OutcomeTransitionModel,
        store: PosteriorStore,
    ) -> Self {
        Self {
            encoder,
            outcome_model,
            store,
            updater: SequentialBayesianUpdater::new(
                config.bayesian.clone(),
                config.surprise.clone(),
            ),
            seasons: SeasonTransitionManager::new(config.season.clone(), &config.bayesian),
            simulator: MonteCarloGameSimulator::new(config.simulation.clone()),
            ev: ExpectedValueCalculator::new(config.ev.clone()),
            retry: config.retry.clone(),
            check_convergence: true,
            checkpoint: None,
        }
    }

    /// Persist the outcome model after every committed game.
    pub fn with_model_checkpoint(mut self, checkpoint: Arc<dyn ModelCheckpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Replace the default month-boundary season strategy.
    pub fn with_season_manager(mut self, seasons: SeasonTransitionManager) -> Self {
        self.seasons = seasons;
        self
    }

    /// Toggle the two-seed convergence check at prediction time.
    pub fn with_convergence_check(mut self, enabled: bool) -> Self {
        self.check_convergence = enabled;
        self
    }

    pub fn encoder(&self) -> &FrozenEncoder {
        &self.encoder
    }

    pub fn outcome_model(&self) -> &OutcomeTransitionModel {
        &self.outcome_model
    }

    pub fn store(&self) -> &PosteriorStore {
        &self.store
    }

    async fn load_pair(
        &self,
        home_id: &str,
        away_id: &str,
    ) -> Result<(TeamPosterior, TeamPosterior)> {
        let ids = vec![home_id.to_string(), away_id.to_string()];
        let store = self.store.clone();
        let mut loaded = execute_with_retry(
            || {
                let store = store.clone();
                let ids = ids.clone();
                async move { store.batch_get(&ids).await }
            },
            &self.retry,
            "load posteriors",
        )
        .await?;
        let now = Utc::now();
        let home = loaded
            .remove(home_id)
            .unwrap_or_else(|| self.updater.default_posterior(home_id, now));
        let away = loaded
            .remove(away_id)
            .unwrap_or_else(|| self.updater.default_posterior(away_id, now));
        Ok((home, away))
    }

    fn season_step(&self, prior: &TeamPosterior, game_date: NaiveDate) -> SeasonedPrior {
        match self.seasons.prepare(prior, game_date) {
            Ok(adjustment) => {
                let transition = match &adjustment.check {
                    SeasonCheck::NewSeason { from, to } => Some(format!("{from} -> {to}")),
                    _ => None,
                };
                SeasonedPrior {
                    posterior: adjustment.posterior,
                    weight: adjustment.observation_weight,
                    transition,
                }
            }
            Err(e) => {
                warn!(team_id = %prior.team_id, error = %e, "Skipping season adjustment");
                SeasonedPrior {
                    posterior: prior.clone(),
                    weight: 1.0,
                    transition: None,
                }
            }
        }
    }

    /// Process one completed game and persist both posteriors.
    ///
    /// On any error the stored posteriors and the outcome model are left
    /// exactly as they were. A game both posteriors already carry is not
    /// applied again.
    pub async fn process_game(&mut self, game: &GameRecord) -> Result<GameOutcome> {
        let validated = ValidatedGame::from_record(game)?;
        self.apply_game(game, validated).await
    }

    async fn apply_game(
        &mut self,
        game: &GameRecord,
        validated: ValidatedGame,
    ) -> Result<GameOutcome> {
        let label = &game.label;
        let ValidatedGame {
            home_label,
            away_label,
            home_features,
            away_features,
        } = validated;

        let (home_prior, away_prior) = self
            .load_pair(&label.home_team_id, &label.away_team_id)
            .await?;
        if home_prior.has_applied(&label.game_id) && away_prior.has_applied(&label.game_id) {
            info!(game_id = %label.game_id, "Game already applied to both posteriors");
            return Ok(GameOutcome::AlreadyApplied);
        }
        let home = self.season_step(&home_prior, label.game_date);
        let away = self.season_step(&away_prior, label.game_date);

        let home_input = build_input(
            &home.posterior,
            &away.posterior,
            &game.context.to_vector(TeamSide::Home),
        );
        let away_input = build_input(
            &away.posterior,
            &home.posterior,
            &game.context.to_vector(TeamSide::Away),
        );
        let home_ce = cross_entropy(&self.outcome_model.predict_input(&home_input)?, &home_label);
        let away_ce = cross_entropy(&self.outcome_model.predict_input(&away_input)?, &away_label);

        // Train a copy; it replaces the live model only after the save.
        let mut model = self.outcome_model.clone();
        let model_loss = model.train_batch(&[
            OutcomeExample {
                input: home_input.clone(),
                target: home_label,
            },
            OutcomeExample {
                input: away_input.clone(),
                target: away_label,
            },
        ])?;
        let home_grad = model.team_mean_gradient(&home_input, &home_label)?;
        let away_grad = model.team_mean_gradient(&away_input, &away_label)?;

        let home_encoded = self.encoder.encode(&home_features)?;
        let away_encoded = self.encoder.encode(&away_features)?;

        let home_unc = self.updater.observation_uncertainty(
            &home.posterior,
            &away.posterior,
            &game.context,
            TeamSide::Home,
            label.margin(TeamSide::Home),
        );
        let away_unc = self.updater.observation_uncertainty(
            &away.posterior,
            &home.posterior,
            &game.context,
            TeamSide::Away,
            label.margin(TeamSide::Away),
        );
        let home_obs = self
            .updater
            .build_observation(&home_encoded, &home_grad, &home_unc, home.weight);
        let away_obs = self
            .updater
            .build_observation(&away_encoded, &away_grad, &away_unc, away.weight);

        let now = Utc::now();
        let mut home_post = self.updater.update(&home.posterior, &home_obs, now)?;
        let mut away_post = self.updater.update(&away.posterior, &away_obs, now)?;
        // Adjust against the opponent's pre-game belief.
        let home_shift = self.updater.apply_opponent_adjustment(
            &mut home_post,
            &away.posterior,
            label.margin(TeamSide::Home),
        );
        let away_shift = self.updater.apply_opponent_adjustment(
            &mut away_post,
            &home.posterior,
            label.margin(TeamSide::Away),
        );
        home_post.record_game(&label.game_id);
        away_post.record_game(&label.game_id);

        let to_save = [home_post.clone(), away_post.clone()];
        let store = self.store.clone();
        execute_with_retry(
            || {
                let store = store.clone();
                let to_save = to_save.clone();
                async move { store.save_many(&to_save).await }
            },
            &self.retry,
            "save posteriors",
        )
        .await?;
        self.outcome_model = model;
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.save_checkpoint(&self.outcome_model.to_weights())?;
        }

        debug!(
            game_id = %label.game_id,
            home_ce,
            away_ce,
            model_loss,
            "Game processed"
        );

        Ok(GameOutcome::Applied(GameReport {
            game_id: label.game_id.clone(),
            game_date: label.game_date,
            home: team_report(&home_prior, &home, home_post, home_ce, home_unc, home_shift),
            away: team_report(&away_prior, &away, away_post, away_ce, away_unc, away_shift),
            model_loss,
        }))
    }

    /// Process up to `limit` unprocessed games from `source` in date order.
    ///
    /// A failed game is recorded and the batch continues.
    pub async fn process_batch(
        &mut self,
        source: &dyn GameSource,
        limit: usize,
    ) -> Result<ProcessingSummary> {
        let mut summary = ProcessingSummary::start();
        info!(session_id = %summary.session_id, limit, "Starting processing session");

        let fetched = execute_with_retry(
            || source.fetch_unprocessed(limit),
            &self.retry,
            "fetch unprocessed games",
        )
        .await?;
        for rejected in fetched.rejected {
            self.quarantine(source, &rejected.game_id, &rejected.error, &mut summary)
                .await;
        }
        let mut games = fetched.games;
        games.sort_by(|a, b| {
            (a.label.game_date, &a.label.game_id).cmp(&(b.label.game_date, &b.label.game_id))
        });
        summary.games_seen = games.len();

        for game in &games {
            let game_id = game.label.game_id.as_str();
            if game.label.processed {
                summary.games_skipped += 1;
                continue;
            }
            let validated = match ValidatedGame::from_record(game) {
                Ok(v) => v,
                Err(e) => {
                    self.quarantine(source, game_id, &e.to_string(), &mut summary)
                        .await;
                    continue;
                }
            };
            match self.apply_game(game, validated).await {
                Ok(outcome) => {
                    let marked = execute_with_retry(
                        || source.mark_processed(game_id),
                        &self.retry,
                        "mark game processed",
                    )
                    .await;
                    match (marked, outcome) {
                        (Ok(_), GameOutcome::Applied(report)) => {
                            summary.games_processed += 1;
                            summary.reports.push(report);
                        }
                        (Ok(_), GameOutcome::AlreadyApplied) => {
                            summary.games_recovered += 1;
                        }
                        (Err(e), _) => {
                            // Posteriors carry the game id, so the next
                            // session marks it without applying it again.
                            error!(
                                game_id,
                                error = %e,
                                "Posteriors saved but game not marked processed"
                            );
                            summary.failures.push(GameFailure {
                                game_id: game_id.to_string(),
                                error: format!("mark processed: {e}"),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(game_id, error = %e, "Game processing failed");
                    summary.failures.push(GameFailure {
                        game_id: game_id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        summary.finished_at = Utc::now();
        summary.log_summary();
        Ok(summary)
    }

    /// Record a game that can never be applied and keep it out of later
    /// fetches.
    async fn quarantine(
        &self,
        source: &dyn GameSource,
        game_id: &str,
        reason: &str,
        summary: &mut ProcessingSummary,
    ) {
        warn!(game_id, reason, "Quarantining unusable game");
        let marked = execute_with_retry(
            || source.mark_failed(game_id, reason),
            &self.retry,
            "quarantine game",
        )
        .await;
        if let Err(e) = &marked {
            error!(game_id, error = %e, "Could not quarantine game");
        } else {
            summary.games_quarantined += 1;
        }
        summary.failures.push(GameFailure {
            game_id: game_id.to_string(),
            error: reason.to_string(),
        });
    }

    /// Posteriors for prediction; storage failures fall back to defaults.
    async fn prediction_pair(
        &self,
        home_id: &str,
        away_id: &str,
    ) -> (TeamPosterior, TeamPosterior) {
        match self.load_pair(home_id, away_id).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    home_id,
                    away_id,
                    error = %e,
                    "Posterior load failed, predicting from defaults"
                );
                let now = Utc::now();
                (
                    self.updater.default_posterior(home_id, now),
                    self.updater.default_posterior(away_id, now),
                )
            }
        }
    }

    pub async fn predict_game(&self, game: &UpcomingGame) -> Result<PredictionReport> {
        let (home, away) = self.prediction_pair(&game.home_team_id, &game.away_team_id).await;

        let home_probs = self
            .outcome_model
            .predict(&home, &away, &game.context, TeamSide::Home)?;
        let away_probs = self
            .outcome_model
            .predict(&away, &home, &game.context, TeamSide::Away)?;

        let sim_config = self.simulator.config();
        let possessions = if game.context.expected_possessions > 0.0 {
            game.context.expected_possessions
        } else {
            sim_config.default_possessions
        };
        let hca = if game.context.neutral_site {
            0.0
        } else {
            sim_config.home_court_advantage
        };
        let input = SimulationInput::symmetric(home_probs, away_probs, possessions, hca);
        let result = self.simulator.simulate(&input)?;

        let convergence_warning = if self.check_convergence {
            match self.simulator.check_convergence(&input) {
                Ok(_) => None,
                Err(e) if e.is_non_fatal() => Some(e.to_string()),
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let confidence = home.confidence.min(away.confidence);
        let opportunities = self.ev.find_opportunities(&result, &game.odds, confidence);

        info!(
            game_id = %game.game_id,
            home = %game.home_team_id,
            away = %game.away_team_id,
            home_win = result.home_win_prob,
            mean_margin = result.mean_margin,
            opportunities = opportunities.len(),
            "Game predicted"
        );

        Ok(PredictionReport {
            game_id: game.game_id.clone(),
            home_team_id: game.home_team_id.clone(),
            away_team_id: game.away_team_id.clone(),
            game_date: game.game_date,
            home_outcome_probs: home_probs,
            away_outcome_probs: away_probs,
            simulation: SimulationSummary::from(&result),
            convergence_warning,
            opportunities,
            confidence,
            home_games_processed: home.games_processed,
            away_games_processed: away.games_processed,
        })
    }

    /// Predict every upcoming game in `[from, to]`, skipping failures.
    pub async fn predict_upcoming(
        &self,
        source: &dyn GameSource,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PredictionReport>> {
        let games = execute_with_retry(
            || source.fetch_upcoming(from, to),
            &self.retry,
            "fetch upcoming games",
        )
        .await?;
        let mut reports = Vec::with_capacity(games.len());
        for game in &games {
            match self.predict_game(game).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(game_id = %game.game_id, error = %e, "Prediction failed"),
            }
        }
        Ok(reports)
    }
}

fn team_report(
    prior: &TeamPosterior,
    seasoned: &SeasonedPrior,
    posterior: TeamPosterior,
    cross_entropy: f64,
    observation: ObservationUncertainty,
    opponent_shift: f64,
) -> TeamUpdateReport {
    let mu_shift = prior
        .mu
        .iter()
        .zip(posterior.mu.iter())
        .map(|(a, b)| (b - a).powi(2))
        .sum::<f64>()
        .sqrt();
    TeamUpdateReport {
        team_id: posterior.team_id.clone(),
        games_processed: posterior.games_processed,
        mu_shift,
        mean_sigma_before: prior.mean_sigma(),
        mean_sigma_after: posterior.mean_sigma(),
        confidence: posterior.confidence,
        cross_entropy,
        observation,
        observation_weight: seasoned.weight,
        opponent_shift,
        season_transition: seasoned.transition.clone(),
    }
}

impl std::fmt::Debug for SequentialProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialProcessor")
            .field("encoder_version", &self.encoder.version())
            .field("outcome_steps", &self.outcome_model.training_steps())
            .field("check_convergence", &self.check_convergence)
            .field("checkpointing", &self.checkpoint.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GameContext, GameLabel, NUM_OUTCOMES};

    fn record(id: &str, date: (i32, u32, u32), processed: bool) -> GameRecord {
        GameRecord {
            label: GameLabel {
                game_id: id.into(),
                home_team_id: "A".into(),
                away_team_id: "B".into(),
                transition_probs_home: [0.125; NUM_OUTCOMES],
                transition_probs_away: [0.125; NUM_OUTCOMES],
                game_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
                processed,
                home_score: None,
                away_score: None,
            },
            home_features: vec![0.1; 80],
            away_features: vec![0.2; 80],
            context: GameContext::default(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_source_orders_and_filters() {
        let source = InMemoryGameSource::new();
        source.add_game(record("late", (2024, 2, 1), false));
        source.add_game(record("done", (2023, 12, 1), true));
        source.add_game(record("early", (2024, 1, 1), false));

        let fetched = source.fetch_unprocessed(10).await.unwrap();
        let ids: Vec<&str> = fetched.games.iter().map(|g| g.label.game_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert!(fetched.rejected.is_empty());
        assert_eq!(source.fetch_unprocessed(1).await.unwrap().games.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_processed_flips_once() {
        let source = InMemoryGameSource::new();
        source.add_game(record("g1", (2024, 1, 1), false));
        assert!(source.mark_processed("g1").await.unwrap());
        assert!(!source.mark_processed("g1").await.unwrap());
        assert_eq!(source.is_processed("g1"), Some(true));
        assert!(source.fetch_unprocessed(10).await.unwrap().games.is_empty());
    }

    #[tokio::test]
    async fn test_quarantined_games_not_fetched() {
        let source = InMemoryGameSource::new();
        source.add_game(record("g1", (2024, 1, 1), false));
        source.add_game(record("g2", (2024, 1, 2), false));
        source.add_unreadable("g3", "label has 2 entries");

        let fetched = source.fetch_unprocessed(10).await.unwrap();
        assert_eq!(fetched.games.len(), 2);
        assert_eq!(fetched.rejected.len(), 1);

        source.mark_failed("g1", "bad label").await.unwrap();
        source.mark_failed("g3", "label has 2 entries").await.unwrap();
        let fetched = source.fetch_unprocessed(10).await.unwrap();
        let ids: Vec<&str> = fetched.games.iter().map(|g| g.label.game_id.as_str()).collect();
        assert_eq!(ids, vec!["g2"]);
        assert!(fetched.rejected.is_empty());
        assert_eq!(source.failure_reason("g1").as_deref(), Some("bad label"));
    }

    #[test]
    fn test_validation_rejects_same_team() {
        let mut game = record("g1", (2024, 1, 1), false);
        assert!(ValidatedGame::from_record(&game).is_ok());
        game.label.away_team_id = "A".into();
        assert!(matches!(
            ValidatedGame::from_record(&game),
            Err(CoreError::InvalidLabel(_))
        ));
    }

    #[tokio::test]
    async fn test_training_samples_cover_both_sides() {
        let source = InMemoryGameSource::new();
        source.add_game(record("g1", (2024, 1, 1), false));
        let samples = source.fetch_training_samples(10).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].features[0], 0.1);
        assert_eq!(samples[1].features[0], 0.2);
    }

    #[test]
    fn test_summary_mean_cross_entropy_empty() {
        let summary = ProcessingSummary::start();
        assert!(summary.mean_cross_entropy().is_none());
        assert!(summary.finished_at >= summary.started_at);
    }
}
