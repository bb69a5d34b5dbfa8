//! End-to-end pipeline tests against in-memory storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;

use hoopcast_rust_core::config::{EncoderConfig, PipelineConfig, RetryConfig};
use hoopcast_rust_core::encoder::{ContrastiveEncoder, FrozenEncoder, Pretrainer};
use hoopcast_rust_core::models::{
    BettingOdds, GameContext, GameLabel, GameRecord, TeamPosterior, UpcomingGame, FEATURE_DIM,
    LATENT_DIM, NUM_OUTCOMES,
};
use hoopcast_rust_core::outcome::{OutcomeModelWeights, OutcomeTransitionModel};
use hoopcast_rust_core::pipeline::{GameSource, InMemoryGameSource, SequentialProcessor};
use hoopcast_rust_core::posterior::{InMemoryBackend, PosteriorCache, PosteriorStore};
use hoopcast_rust_core::season::SeasonTransitionManager;
use hoopcast_rust_core::weights::{ModelCheckpoint, WeightsRepository};

const HOME_PROBS: [f64; NUM_OUTCOMES] = [0.30, 0.20, 0.10, 0.15, 0.08, 0.04, 0.05, 0.08];
const AWAY_PROBS: [f64; NUM_OUTCOMES] = [0.25, 0.25, 0.08, 0.17, 0.07, 0.05, 0.06, 0.07];

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.outcome_model.hidden_dims = vec![32, 16];
    config.retry = RetryConfig {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    };
    config
}

fn encoder_config() -> EncoderConfig {
    EncoderConfig {
        hidden_dims: vec![16, 8],
        decoder_hidden_dims: vec![8],
        ..Default::default()
    }
}

fn frozen_encoder() -> FrozenEncoder {
    ContrastiveEncoder::new(&encoder_config(), "it-encoder").freeze()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn features(seed: usize) -> Vec<f64> {
    (0..FEATURE_DIM)
        .map(|i| ((i + seed) as f64 * 0.13).sin() * 0.5)
        .collect()
}

fn game(id: &str, home: &str, away: &str, on: NaiveDate, score: Option<(u16, u16)>) -> GameRecord {
    GameRecord {
        label: GameLabel {
            game_id: id.to_string(),
            home_team_id: home.to_string(),
            away_team_id: away.to_string(),
            transition_probs_home: HOME_PROBS,
            transition_probs_away: AWAY_PROBS,
            game_date: on,
            processed: false,
            home_score: score.map(|s| s.0),
            away_score: score.map(|s| s.1),
        },
        home_features: features(id.len()),
        away_features: features(id.len() + 7),
        context: GameContext::default(),
    }
}

struct Harness {
    processor: SequentialProcessor,
    backend: Arc<InMemoryBackend>,
    source: InMemoryGameSource,
}

fn harness_with(encoder: FrozenEncoder) -> Harness {
    let config = test_config();
    let backend = Arc::new(InMemoryBackend::new());
    let cache = Arc::new(PosteriorCache::new(&config.cache));
    let store = PosteriorStore::new(backend.clone(), cache, config.bayesian.clone());
    let model = OutcomeTransitionModel::new(&config.outcome_model, "it-outcome");
    Harness {
        processor: SequentialProcessor::new(&config, encoder, model, store),
        backend,
        source: InMemoryGameSource::new(),
    }
}

fn harness() -> Harness {
    harness_with(frozen_encoder())
}

#[tokio::test]
async fn test_cold_start_team_first_game() {
    let mut h = harness();
    h.source.add_game(game("g1", "DUKE", "UNC", date(2024, 1, 15), None));

    let summary = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 1);
    assert!(summary.failures.is_empty());

    let duke = h.processor.store().get("DUKE").await.unwrap();
    assert_eq!(duke.games_processed, 1);
    assert!(duke.sigma.iter().all(|s| *s < 1.0));
    assert!(duke.mu.iter().any(|m| *m != 0.0));
    assert_eq!(duke.last_season, "2023-24");
    assert!(duke.confidence > 0.0 && duke.confidence < 0.95);

    let report = &summary.reports[0];
    assert!(report.home.mu_shift > 0.0);
    assert!(report.home.mean_sigma_after < report.home.mean_sigma_before);
    assert_eq!(h.source.is_processed("g1"), Some(true));
}

#[tokio::test]
async fn test_season_rollover_injects_variance() {
    let mut h = harness();
    let mut prior = TeamPosterior::new_default("DUKE", 1.0, Utc::now());
    prior.mu = [0.5; LATENT_DIM];
    prior.sigma = [0.2; LATENT_DIM];
    prior.games_processed = 20;
    prior.confidence = 0.8;
    prior.last_season = "2023-24".to_string();
    h.processor.store().save(&prior).await.unwrap();

    // The season step alone
    let config = test_config();
    let seasons = SeasonTransitionManager::new(config.season.clone(), &config.bayesian);
    let adjusted = seasons.prepare(&prior, date(2024, 11, 15)).unwrap();
    assert_eq!(adjusted.posterior.mu, prior.mu);
    for s in adjusted.posterior.sigma {
        assert!((s - 0.29_f64.sqrt()).abs() < 1e-12);
        assert!((s - 0.538).abs() < 1e-3);
    }

    // Through the pipeline
    h.source.add_game(game("g1", "DUKE", "UNC", date(2024, 11, 15), Some((75, 70))));
    let summary = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 1);
    assert_eq!(
        summary.reports[0].home.season_transition.as_deref(),
        Some("2023-24 -> 2024-25")
    );

    let duke = h.processor.store().get("DUKE").await.unwrap();
    assert_eq!(duke.last_season, "2024-25");
    assert_eq!(duke.games_processed, 21);
    assert_eq!(duke.transition_history.len(), 1);
    assert_eq!(duke.transition_history[0].variance_added, 0.25);
    // Wider than before the transition, narrower than right after it
    assert!(duke.sigma.iter().all(|s| *s > 0.2 && *s < 0.29_f64.sqrt()));
}

#[tokio::test]
async fn test_processing_never_changes_encoder() {
    let mut h = harness();
    let input = features(3);
    let before = h.processor.encoder().encode(&input).unwrap();
    let fingerprint = h.processor.encoder().fingerprint();

    for (i, d) in (10..20).enumerate() {
        let (home, away) = if i % 2 == 0 { ("A", "B") } else { ("B", "C") };
        h.source
            .add_game(game(
                &format!("g{i}"),
                home,
                away,
                date(2024, 1, d),
                Some((70 + i as u16, 68)),
            ));
    }
    let summary = h.processor.process_batch(&h.source, 100).await.unwrap();
    assert_eq!(summary.games_processed, 10);
    assert_eq!(h.processor.outcome_model().training_steps(), 10);

    let after = h.processor.encoder().encode(&input).unwrap();
    assert!(after.bits_equal(&before));
    assert_eq!(h.processor.encoder().fingerprint(), fingerprint);
    h.processor.encoder().verify_repeatable(&input, 20).unwrap();
}

#[tokio::test]
async fn test_games_processed_in_date_order_once() {
    let mut h = harness();
    h.source.add_game(game("late", "A", "B", date(2024, 2, 1), None));
    h.source.add_game(game("early", "A", "B", date(2024, 1, 1), None));

    let first = h.processor.process_batch(&h.source, 10).await.unwrap();
    let order: Vec<&str> = first.reports.iter().map(|r| r.game_id.as_str()).collect();
    assert_eq!(order, vec!["early", "late"]);
    assert_eq!(first.reports[0].home.games_processed, 1);
    assert_eq!(first.reports[1].home.games_processed, 2);

    let snapshot = h.backend.raw("A").unwrap();
    let second = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(second.games_seen, 0);
    assert_eq!(second.games_processed, 0);
    assert_eq!(h.backend.raw("A").unwrap(), snapshot);
    assert_ne!(first.session_id, second.session_id);
}

#[tokio::test]
async fn test_failed_save_leaves_no_partial_state() {
    let mut h = harness();
    h.source.add_game(game("g1", "A", "B", date(2024, 1, 5), Some((80, 60))));
    h.backend.fail_next_saves(3);

    let summary = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 0);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].game_id, "g1");
    assert!(h.backend.is_empty());
    assert_eq!(h.processor.outcome_model().training_steps(), 0);
    assert_eq!(h.source.is_processed("g1"), Some(false));

    // Storage recovers; the same game goes through on the next session
    let retry = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(retry.games_processed, 1);
    assert_eq!(h.backend.len(), 2);
}

#[tokio::test]
async fn test_transient_save_failure_is_retried() {
    let mut h = harness();
    h.source.add_game(game("g1", "A", "B", date(2024, 1, 5), None));
    h.backend.fail_next_saves(2);

    let summary = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 1);
    assert!(summary.failures.is_empty());
}

#[tokio::test]
async fn test_bad_game_does_not_halt_batch() {
    let mut h = harness();
    let mut bad = game("bad", "A", "B", date(2024, 1, 1), None);
    bad.label.transition_probs_home = [0.0; NUM_OUTCOMES];
    h.source.add_game(bad);
    let mut same_team = game("same", "C", "C", date(2024, 1, 2), None);
    same_team.label.game_id = "same".into();
    h.source.add_game(same_team);
    h.source.add_game(game("good", "A", "B", date(2024, 1, 3), None));

    let summary = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(summary.games_seen, 3);
    assert_eq!(summary.games_processed, 1);
    let failed: Vec<&str> = summary.failures.iter().map(|f| f.game_id.as_str()).collect();
    assert_eq!(failed, vec!["bad", "same"]);
    assert_eq!(summary.games_quarantined, 2);
    assert_eq!(h.source.is_processed("bad"), Some(false));
    assert!(h.source.failure_reason("same").unwrap().contains("same team"));
    assert_eq!(h.processor.store().get("A").await.unwrap().games_processed, 1);

    // Quarantined games stay out of later sessions
    let next = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(next.games_seen, 0);
    assert!(next.failures.is_empty());
}

#[tokio::test]
async fn test_unreadable_rows_reported_and_quarantined() {
    let mut h = harness();
    h.source
        .add_unreadable(
            "broken",
            "dimension mismatch in away label of game broken: expected 8, got 2",
        );
    h.source.add_game(game("good", "A", "B", date(2024, 1, 3), None));

    let summary = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 1);
    assert_eq!(summary.games_quarantined, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].game_id, "broken");
    assert!(h.source.failure_reason("broken").is_some());

    let next = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert!(next.failures.is_empty());
    assert_eq!(next.games_quarantined, 0);
}

#[tokio::test]
async fn test_unmarked_game_not_applied_twice() {
    let mut h = harness();
    h.source.add_game(game("g1", "A", "B", date(2024, 1, 5), Some((72, 64))));
    h.source.fail_next_marks(3);

    let first = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(first.games_processed, 0);
    assert_eq!(first.failures.len(), 1);
    assert!(first.failures[0].error.starts_with("mark processed"));
    assert_eq!(h.source.is_processed("g1"), Some(false));
    let a = h.processor.store().get("A").await.unwrap();
    assert_eq!(a.games_processed, 1);
    assert!(a.has_applied("g1"));
    let snapshot = h.backend.raw("A").unwrap();

    // The next session sees the game id on both posteriors and only marks it
    let second = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(second.games_processed, 0);
    assert_eq!(second.games_recovered, 1);
    assert!(second.failures.is_empty());
    assert_eq!(h.source.is_processed("g1"), Some(true));
    assert_eq!(h.processor.store().get("A").await.unwrap().games_processed, 1);
    assert_eq!(h.processor.store().get("B").await.unwrap().games_processed, 1);
    assert_eq!(h.backend.raw("A").unwrap(), snapshot);
    assert_eq!(h.processor.outcome_model().training_steps(), 1);
}

#[derive(Default)]
struct RecordingCheckpoint {
    steps: Mutex<Vec<u64>>,
}

impl ModelCheckpoint for RecordingCheckpoint {
    fn save_checkpoint(&self, weights: &OutcomeModelWeights) -> hoopcast_rust_core::Result<()> {
        self.steps.lock().push(weights.training_steps);
        Ok(())
    }
}

#[tokio::test]
async fn test_outcome_model_checkpointed_per_game() {
    let checkpoint = Arc::new(RecordingCheckpoint::default());
    let Harness {
        processor,
        backend,
        source,
    } = harness();
    let mut processor = processor.with_model_checkpoint(checkpoint.clone());
    for (i, d) in [3u32, 4, 5].iter().enumerate() {
        source.add_game(game(&format!("g{i}"), "A", "B", date(2024, 1, *d), None));
    }

    let summary = processor.process_batch(&source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 3);
    assert_eq!(*checkpoint.steps.lock(), vec![1, 2, 3]);

    // A game whose posteriors were not saved is not checkpointed
    source.add_game(game("g3", "A", "B", date(2024, 1, 6), None));
    backend.fail_next_saves(3);
    let failed = processor.process_batch(&source, 10).await.unwrap();
    assert_eq!(failed.failures.len(), 1);
    assert_eq!(checkpoint.steps.lock().len(), 3);
}

#[tokio::test]
async fn test_corrupt_stored_posterior_treated_as_new_team() {
    let mut h = harness();
    h.backend
        .insert_raw("A", serde_json::json!({ "mu": [1.0], "sigma": "oops" }));
    h.source.add_game(game("g1", "A", "B", date(2024, 1, 5), None));

    let summary = h.processor.process_batch(&h.source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 1);
    assert_eq!(h.processor.store().get("A").await.unwrap().games_processed, 1);
}

fn upcoming(home: &str, away: &str) -> UpcomingGame {
    UpcomingGame {
        game_id: "u1".into(),
        home_team_id: home.into(),
        away_team_id: away.into(),
        game_date: date(2025, 3, 1),
        context: GameContext::default(),
        odds: BettingOdds {
            home_moneyline: Some(-150),
            away_moneyline: Some(130),
            spread_line: Some(-3.5),
            home_spread_odds: Some(-110),
            away_spread_odds: Some(-110),
            total_line: Some(140.5),
            over_odds: Some(-110),
            under_odds: Some(-110),
        },
    }
}

#[tokio::test]
async fn test_prediction_for_unknown_teams_uses_defaults() {
    let h = harness();
    let report = h.processor.predict_game(&upcoming("NEW1", "NEW2")).await.unwrap();

    assert_eq!(report.home_games_processed, 0);
    assert_eq!(report.away_games_processed, 0);
    assert_eq!(report.confidence, 0.0);
    for probs in [report.home_outcome_probs, report.away_outcome_probs] {
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
    let sim = &report.simulation;
    assert_eq!(sim.n_simulations, 10_000);
    assert!((sim.home_win_prob + sim.away_win_prob + sim.tie_prob - 1.0).abs() < 1e-9);
    assert!(report.opportunities.windows(2).all(|w| w[0].edge >= w[1].edge));
    assert!(report.opportunities.iter().all(|o| o.edge >= 0.05));
    // Nothing was written for teams that were only predicted
    assert!(h.backend.is_empty());
}

#[tokio::test]
async fn test_predict_upcoming_reads_source_window() {
    let h = harness();
    h.source.add_upcoming(upcoming("A", "B"));
    let reports = h
        .processor
        .predict_upcoming(&h.source, date(2025, 2, 1), date(2025, 3, 31))
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);

    let none = h
        .processor
        .predict_upcoming(&h.source, date(2025, 4, 1), date(2025, 4, 30))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_pretrain_persist_and_process() {
    let source = InMemoryGameSource::new();
    for i in 0..12u32 {
        source.add_game(game(&format!("h{i}"), "A", "B", date(2023, 12, 1 + i), Some((70, 65))));
    }
    let samples = source.fetch_training_samples(1_000).await.unwrap();
    assert_eq!(samples.len(), 24);

    let config = EncoderConfig {
        max_epochs: 3,
        batch_size: 8,
        negatives_per_sample: 3,
        ..encoder_config()
    };
    let (encoder, report) = Pretrainer::new(config).unwrap().train(&samples, "it-v1").unwrap();
    assert!(report.epochs_run >= 1);

    let dir = std::env::temp_dir().join(format!("hoopcast-it-{}", uuid::Uuid::new_v4()));
    let repo = WeightsRepository::new(&dir);
    repo.save_frozen_encoder(&encoder).unwrap();
    let loaded = repo.load_frozen_encoder().unwrap();
    assert_eq!(loaded.fingerprint(), encoder.fingerprint());

    let Harness {
        processor, source, ..
    } = harness_with(loaded);
    let mut processor = processor.with_model_checkpoint(Arc::new(repo.clone()));
    source.add_game(game("g1", "A", "B", date(2024, 1, 20), Some((66, 71))));
    let summary = processor.process_batch(&source, 10).await.unwrap();
    assert_eq!(summary.games_processed, 1);

    // Checkpointed with the game, no explicit save needed
    let restored = repo.load_outcome_model().unwrap().unwrap();
    assert_eq!(restored.training_steps, 1);

    std::fs::remove_dir_all(&dir).ok();
}
