//! Pipeline configuration.
//!
//! Every tunable lives in one of the structs below with its default and
//! valid range documented on the field. Values are loaded from environment
//! variables with the defaults as fallback, then validated once at start-up.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{CoreError, Result};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(CoreError::InvalidConfig(msg()))
    }
}

/// Contrastive pretraining settings.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Encoder trunk hidden sizes (default: 64, 32)
    pub hidden_dims: Vec<usize>,
    /// Decoder hidden sizes (default: 32, 64)
    pub decoder_hidden_dims: Vec<usize>,
    /// KL weight β, >= 0 (default: 0.1)
    pub beta: f64,
    /// InfoNCE weight λ, >= 0 (default: 0.5)
    pub lambda: f64,
    /// InfoNCE temperature T, > 0 (default: 0.1)
    pub temperature: f64,
    /// Negatives sampled per example, >= 1 (default: 8)
    pub negatives_per_sample: usize,
    /// Mini-batch size, >= 1 (default: 32)
    pub batch_size: usize,
    /// Maximum epochs, >= 1 (default: 100)
    pub max_epochs: usize,
    /// Adam learning rate, > 0 (default: 1e-3)
    pub learning_rate: f64,
    /// Epochs without validation improvement before stopping, >= 1 (default: 5)
    pub patience: usize,
    /// Stop when |Δ validation loss| falls below this, >= 0 (default: 1e-5)
    pub convergence_threshold: f64,
    /// Fraction held out for validation, in (0, 1) (default: 0.2)
    pub validation_split: f64,
    /// Seed for init, shuffling, noise and negative sampling (default: 42)
    pub seed: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![64, 32],
            decoder_hidden_dims: vec![32, 64],
            beta: 0.1,
            lambda: 0.5,
            temperature: 0.1,
            negatives_per_sample: 8,
            batch_size: 32,
            max_epochs: 100,
            learning_rate: 1e-3,
            patience: 5,
            convergence_threshold: 1e-5,
            validation_split: 0.2,
            seed: 42,
        }
    }
}

impl EncoderConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            beta: env_or("ENCODER_BETA", d.beta),
            lambda: env_or("ENCODER_LAMBDA", d.lambda),
            temperature: env_or("ENCODER_TEMPERATURE", d.temperature),
            negatives_per_sample: env_or("ENCODER_NEGATIVES", d.negatives_per_sample),
            batch_size: env_or("ENCODER_BATCH_SIZE", d.batch_size),
            max_epochs: env_or("ENCODER_MAX_EPOCHS", d.max_epochs),
            learning_rate: env_or("ENCODER_LEARNING_RATE", d.learning_rate),
            patience: env_or("ENCODER_PATIENCE", d.patience),
            convergence_threshold: env_or("ENCODER_CONVERGENCE_THRESHOLD", d.convergence_threshold),
            validation_split: env_or("ENCODER_VALIDATION_SPLIT", d.validation_split),
            seed: env_or("ENCODER_SEED", d.seed),
            ..d
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.beta >= 0.0, || format!("beta must be >= 0, got {}", self.beta))?;
        ensure(self.lambda >= 0.0, || format!("lambda must be >= 0, got {}", self.lambda))?;
        ensure(self.temperature > 0.0, || {
            format!("temperature must be > 0, got {}", self.temperature)
        })?;
        ensure(self.negatives_per_sample >= 1, || "negatives_per_sample must be >= 1".into())?;
        ensure(self.batch_size >= 1, || "batch_size must be >= 1".into())?;
        ensure(self.max_epochs >= 1, || "max_epochs must be >= 1".into())?;
        ensure(self.learning_rate > 0.0, || "learning_rate must be > 0".into())?;
        ensure(self.patience >= 1, || "patience must be >= 1".into())?;
        ensure(self.convergence_threshold >= 0.0, || {
            "convergence_threshold must be >= 0".into()
        })?;
        ensure(
            self.validation_split > 0.0 && self.validation_split < 1.0,
            || format!("validation_split must be in (0, 1), got {}", self.validation_split),
        )
    }
}

/// Sequential Bayesian updating settings.
#[derive(Debug, Clone)]
pub struct BayesianConfig {
    /// Prior sigma for unseen teams, in [min, max] (default: 1.0)
    pub initial_uncertainty: f64,
    /// Lower sigma bound, in (0, max) (default: 0.05)
    pub min_uncertainty: f64,
    /// Upper sigma bound (default: 2.0)
    pub max_uncertainty: f64,
    /// Observation sigma before any games, > 0 (default: 0.5)
    pub base_observation_uncertainty: f64,
    /// Geometric decay of observation sigma per processed game, in (0, 1] (default: 0.97)
    pub observation_decay: f64,
    /// Neutral-site multiplier (default: 1.2)
    pub neutral_site_factor: f64,
    /// Non-conference multiplier (default: 1.1)
    pub non_conference_factor: f64,
    /// Multiplier when rest is under two days (default: 1.15)
    pub short_rest_factor: f64,
    /// Postseason multiplier (default: 0.9)
    pub postseason_factor: f64,
    /// Asymptote of the confidence curve, in (0, 1] (default: 0.95)
    pub confidence_threshold: f64,
    /// Games for the confidence curve to reach ~95% of the asymptote, > 0 (default: 30)
    pub max_games_for_convergence: f64,
    /// Step along the outcome-likelihood gradient when forming the observation (default: 0.5)
    pub likelihood_step: f64,
    /// Apply the opponent-strength μ nudge (default: true)
    pub opponent_adjustment_enabled: bool,
    /// Rate of the opponent-strength μ nudge (default: 0.05)
    pub opponent_adjustment_rate: f64,
    /// Absolute bound on the μ nudge per game (default: 0.1)
    pub max_opponent_adjustment: f64,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            initial_uncertainty: 1.0,
            min_uncertainty: 0.05,
            max_uncertainty: 2.0,
            base_observation_uncertainty: 0.5,
            observation_decay: 0.97,
            neutral_site_factor: 1.2,
            non_conference_factor: 1.1,
            short_rest_factor: 1.15,
            postseason_factor: 0.9,
            confidence_threshold: 0.95,
            max_games_for_convergence: 30.0,
            likelihood_step: 0.5,
            opponent_adjustment_enabled: true,
            opponent_adjustment_rate: 0.05,
            max_opponent_adjustment: 0.1,
        }
    }
}

impl BayesianConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            initial_uncertainty: env_or("BAYES_INITIAL_UNCERTAINTY", d.initial_uncertainty),
            min_uncertainty: env_or("BAYES_MIN_UNCERTAINTY", d.min_uncertainty),
            max_uncertainty: env_or("BAYES_MAX_UNCERTAINTY", d.max_uncertainty),
            base_observation_uncertainty: env_or(
                "BAYES_BASE_OBSERVATION_UNCERTAINTY",
                d.base_observation_uncertainty,
            ),
            observation_decay: env_or("BAYES_OBSERVATION_DECAY", d.observation_decay),
            confidence_threshold: env_or("BAYES_CONFIDENCE_THRESHOLD", d.confidence_threshold),
            max_games_for_convergence: env_or(
                "BAYES_MAX_GAMES_FOR_CONVERGENCE",
                d.max_games_for_convergence,
            ),
            likelihood_step: env_or("BAYES_LIKELIHOOD_STEP", d.likelihood_step),
            opponent_adjustment_enabled: env::var("BAYES_OPPONENT_ADJUSTMENT")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(d.opponent_adjustment_enabled),
            ..d
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure(
            self.min_uncertainty > 0.0 && self.min_uncertainty < self.max_uncertainty,
            || {
                format!(
                    "min_uncertainty must be in (0, max_uncertainty), got {} / {}",
                    self.min_uncertainty, self.max_uncertainty
                )
            },
        )?;
        ensure(
            (self.min_uncertainty..=self.max_uncertainty).contains(&self.initial_uncertainty),
            || "initial_uncertainty must lie within [min, max]".into(),
        )?;
        ensure(self.base_observation_uncertainty > 0.0, || {
            "base_observation_uncertainty must be > 0".into()
        })?;
        ensure(
            self.observation_decay > 0.0 && self.observation_decay <= 1.0,
            || "observation_decay must be in (0, 1]".into(),
        )?;
        ensure(
            self.confidence_threshold > 0.0 && self.confidence_threshold <= 1.0,
            || "confidence_threshold must be in (0, 1]".into(),
        )?;
        ensure(self.max_games_for_convergence > 0.0, || {
            "max_games_for_convergence must be > 0".into()
        })?;
        ensure(self.likelihood_step >= 0.0, || "likelihood_step must be >= 0".into())?;
        ensure(self.max_opponent_adjustment >= 0.0, || {
            "max_opponent_adjustment must be >= 0".into()
        })
    }
}

/// Opponent-strength "surprise" multiplier on observation uncertainty.
///
/// The constants are heuristics; they are kept configurable rather than
/// fixed.
#[derive(Debug, Clone)]
pub struct SurprisePolicy {
    /// Weight of the surprise term (default: 0.3)
    pub weight: f64,
    /// Lower multiplier bound (default: 0.5)
    pub min_multiplier: f64,
    /// Upper multiplier bound (default: 2.0)
    pub max_multiplier: f64,
    /// Points of expected margin per unit of strength difference (default: 10.0)
    pub margin_per_strength: f64,
    /// Margin error that counts as one unit of surprise, in points (default: 12.0)
    pub surprise_scale: f64,
}

impl Default for SurprisePolicy {
    fn default() -> Self {
        Self {
            weight: 0.3,
            min_multiplier: 0.5,
            max_multiplier: 2.0,
            margin_per_strength: 10.0,
            surprise_scale: 12.0,
        }
    }
}

impl SurprisePolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            weight: env_or("SURPRISE_WEIGHT", d.weight),
            min_multiplier: env_or("SURPRISE_MIN_MULTIPLIER", d.min_multiplier),
            max_multiplier: env_or("SURPRISE_MAX_MULTIPLIER", d.max_multiplier),
            ..d
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.weight >= 0.0, || "surprise weight must be >= 0".into())?;
        ensure(
            self.min_multiplier > 0.0 && self.min_multiplier <= 1.0,
            || "surprise min_multiplier must be in (0, 1]".into(),
        )?;
        ensure(self.max_multiplier >= 1.0, || "surprise max_multiplier must be >= 1".into())?;
        ensure(self.surprise_scale > 0.0, || "surprise_scale must be > 0".into())
    }
}

/// Season boundary handling.
#[derive(Debug, Clone)]
pub struct SeasonConfig {
    /// Variance added to every σ² at a season boundary, >= 0 (default: 0.25)
    pub inter_year_variance: f64,
    /// Observation weight multiplier per season of age for backfill, in (0, 1] (default: 0.5)
    pub cross_season_decay: f64,
    /// First month (1-12) that belongs to the season starting that year (default: 7)
    pub boundary_month: u32,
}

impl Default for SeasonConfig {
    fn default() -> Self {
        Self {
            inter_year_variance: 0.25,
            cross_season_decay: 0.5,
            boundary_month: 7,
        }
    }
}

impl SeasonConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            inter_year_variance: env_or("SEASON_INTER_YEAR_VARIANCE", d.inter_year_variance),
            cross_season_decay: env_or("SEASON_CROSS_SEASON_DECAY", d.cross_season_decay),
            boundary_month: env_or("SEASON_BOUNDARY_MONTH", d.boundary_month),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.inter_year_variance >= 0.0, || {
            "inter_year_variance must be >= 0".into()
        })?;
        ensure(
            self.cross_season_decay > 0.0 && self.cross_season_decay <= 1.0,
            || "cross_season_decay must be in (0, 1]".into(),
        )?;
        // Months 4..=11 keep both the Nov-Dec and Jan-Mar rules intact.
        ensure((4..=11).contains(&self.boundary_month), || {
            format!("boundary_month must be in 4..=11, got {}", self.boundary_month)
        })
    }
}

/// Outcome transition model settings.
#[derive(Debug, Clone)]
pub struct OutcomeModelConfig {
    /// Hidden layer sizes (default: 128, 64, 32)
    pub hidden_dims: Vec<usize>,
    /// Adam learning rate, > 0 (default: 1e-3)
    pub learning_rate: f64,
    /// Initialization seed (default: 7)
    pub seed: u64,
}

impl Default for OutcomeModelConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![128, 64, 32],
            learning_rate: 1e-3,
            seed: 7,
        }
    }
}

impl OutcomeModelConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            learning_rate: env_or("OUTCOME_LEARNING_RATE", d.learning_rate),
            seed: env_or("OUTCOME_SEED", d.seed),
            ..d
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure(!self.hidden_dims.is_empty(), || "outcome hidden_dims must not be empty".into())?;
        ensure(self.hidden_dims.iter().all(|d| *d > 0), || {
            "outcome hidden_dims must be > 0".into()
        })?;
        ensure(self.learning_rate > 0.0, || "outcome learning_rate must be > 0".into())
    }
}

/// Monte Carlo simulation settings.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Trials per simulation, >= 1000 (default: 10,000)
    pub n_simulations: usize,
    /// Home-court advantage added to the home margin, in points (default: 3.0)
    pub home_court_advantage: f64,
    /// Possessions per team when the context gives none (default: 70)
    pub default_possessions: f64,
    /// Base RNG seed (default: 2024)
    pub seed: u64,
    /// Max allowed win-probability gap between seeds (default: 0.02)
    pub divergence_tolerance: f64,
    /// Trials per parallel chunk (default: 1,000)
    pub chunk_size: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_simulations: 10_000,
            home_court_advantage: 3.0,
            default_possessions: 70.0,
            seed: 2024,
            divergence_tolerance: 0.02,
            chunk_size: 1_000,
        }
    }
}

impl SimulationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            n_simulations: env_or("SIM_N_SIMULATIONS", d.n_simulations),
            home_court_advantage: env_or("SIM_HOME_COURT_ADVANTAGE", d.home_court_advantage),
            default_possessions: env_or("SIM_DEFAULT_POSSESSIONS", d.default_possessions),
            seed: env_or("SIM_SEED", d.seed),
            divergence_tolerance: env_or("SIM_DIVERGENCE_TOLERANCE", d.divergence_tolerance),
            ..d
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.n_simulations >= 1_000, || {
            format!("n_simulations must be >= 1000, got {}", self.n_simulations)
        })?;
        ensure(self.default_possessions > 0.0, || "default_possessions must be > 0".into())?;
        ensure(self.divergence_tolerance > 0.0, || "divergence_tolerance must be > 0".into())?;
        ensure(self.chunk_size >= 1, || "chunk_size must be >= 1".into())
    }
}

/// Expected-value screening.
#[derive(Debug, Clone)]
pub struct EvConfig {
    /// Minimum simulated-minus-implied edge to flag (default: 0.05)
    pub min_ev_threshold: f64,
}

impl Default for EvConfig {
    fn default() -> Self {
        Self {
            min_ev_threshold: 0.05,
        }
    }
}

/// Posterior cache in front of durable storage.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry lifetime (default: 30 minutes)
    pub ttl: Duration,
    /// Maximum entries before oldest-first eviction (default: 1,024)
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            capacity: 1_024,
        }
    }
}

/// Retry policy for transient collaborator failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first, >= 1 (default: 3)
    pub max_attempts: u32,
    /// First backoff (default: 1s)
    pub base_backoff: Duration,
    /// Backoff cap (default: 10s)
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// All pipeline tunables.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub encoder: EncoderConfig,
    pub bayesian: BayesianConfig,
    pub surprise: SurprisePolicy,
    pub season: SeasonConfig,
    pub outcome_model: OutcomeModelConfig,
    pub simulation: SimulationConfig,
    pub ev: EvConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
}

impl PipelineConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        Self {
            encoder: EncoderConfig::from_env(),
            bayesian: BayesianConfig::from_env(),
            surprise: SurprisePolicy::from_env(),
            season: SeasonConfig::from_env(),
            outcome_model: OutcomeModelConfig::from_env(),
            simulation: SimulationConfig::from_env(),
            ev: EvConfig {
                min_ev_threshold: env_or("MIN_EV_THRESHOLD", EvConfig::default().min_ev_threshold),
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(env_or("POSTERIOR_CACHE_TTL_SECS", 30 * 60)),
                capacity: env_or("POSTERIOR_CACHE_CAPACITY", 1_024),
            },
            retry: RetryConfig {
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", 3),
                base_backoff: Duration::from_millis(env_or("RETRY_BASE_BACKOFF_MS", 1_000)),
                max_backoff: Duration::from_millis(env_or("RETRY_MAX_BACKOFF_MS", 10_000)),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        self.bayesian.validate()?;
        self.surprise.validate()?;
        self.season.validate()?;
        self.outcome_model.validate()?;
        self.simulation.validate()?;
        ensure(self.ev.min_ev_threshold >= 0.0, || "min_ev_threshold must be >= 0".into())?;
        ensure(self.cache.capacity >= 1, || "cache capacity must be >= 1".into())?;
        ensure(self.retry.max_attempts >= 1, || "retry max_attempts must be >= 1".into())
    }

    /// Log current configuration (useful at startup)
    pub fn log_config(&self) {
        info!("PipelineConfig loaded:");
        info!(
            "  uncertainty: initial={} min={} max={}",
            self.bayesian.initial_uncertainty,
            self.bayesian.min_uncertainty,
            self.bayesian.max_uncertainty
        );
        info!(
            "  observation: base={} decay={}",
            self.bayesian.base_observation_uncertainty, self.bayesian.observation_decay
        );
        info!(
            "  season: inter_year_variance={} cross_season_decay={} boundary_month={}",
            self.season.inter_year_variance,
            self.season.cross_season_decay,
            self.season.boundary_month
        );
        info!(
            "  encoder: beta={} lambda={} temperature={} patience={}",
            self.encoder.beta, self.encoder.lambda, self.encoder.temperature, self.encoder.patience
        );
        info!(
            "  simulation: n={} home_court={} tolerance={}",
            self.simulation.n_simulations,
            self.simulation.home_court_advantage,
            self.simulation.divergence_tolerance
        );
        info!("  min_ev_threshold: {}", self.ev.min_ev_threshold);
        info!(
            "  cache: ttl={}s capacity={}",
            self.cache.ttl.as_secs(),
            self.cache.capacity
        );
    }
}
