//! `game_labels` and `upcoming_games` tables.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::encoder::PretrainingSample;
use crate::error::{CoreError, Result};
use crate::models::{
    BettingOdds, GameContext, GameLabel, GameRecord, OutcomeProbs, UpcomingGame, NUM_OUTCOMES,
};
use crate::pipeline::{GameFailure, GameSource, UnprocessedGames};

const GAME_LABEL_COLUMNS: &str = r#"
    game_id, home_team_id, away_team_id, game_date,
    transition_probs_home, transition_probs_away,
    home_features, away_features, home_score, away_score,
    neutral_site, conference_game, postseason,
    home_rest_days, away_rest_days, processed
"#;

/// Completed game row from game_labels
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GameLabelRow {
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub game_date: NaiveDate,
    pub transition_probs_home: Json<Vec<f64>>,
    pub transition_probs_away: Json<Vec<f64>>,
    pub home_features: Json<Vec<f64>>,
    pub away_features: Json<Vec<f64>>,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub neutral_site: bool,
    pub conference_game: bool,
    pub postseason: bool,
    pub home_rest_days: Option<i32>,
    pub away_rest_days: Option<i32>,
    pub processed: bool,
}

fn probs_array(game_id: &str, side: &str, values: &[f64]) -> Result<OutcomeProbs> {
    <OutcomeProbs>::try_from(values).map_err(|_| {
        CoreError::dimension(format!("{side} label of game {game_id}"), NUM_OUTCOMES, values.len())
    })
}

impl GameLabelRow {
    pub fn into_record(self) -> Result<GameRecord> {
        let transition_probs_home =
            probs_array(&self.game_id, "home", &self.transition_probs_home)?;
        let transition_probs_away =
            probs_array(&self.game_id, "away", &self.transition_probs_away)?;
        let score = |s: Option<i32>| s.and_then(|v| u16::try_from(v).ok());
        let rest = |d: Option<i32>| d.and_then(|v| u32::try_from(v).ok());
        Ok(GameRecord {
            label: GameLabel {
                game_id: self.game_id,
                home_team_id: self.home_team_id,
                away_team_id: self.away_team_id,
                transition_probs_home,
                transition_probs_away,
                game_date: self.game_date,
                processed: self.processed,
                home_score: score(self.home_score),
                away_score: score(self.away_score),
            },
            home_features: self.home_features.0,
            away_features: self.away_features.0,
            context: GameContext {
                neutral_site: self.neutral_site,
                conference_game: self.conference_game,
                postseason: self.postseason,
                home_rest_days: rest(self.home_rest_days),
                away_rest_days: rest(self.away_rest_days),
                ..Default::default()
            },
        })
    }
}

/// Scheduled game row from upcoming_games
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UpcomingGameRow {
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub game_date: NaiveDate,
    pub odds: Json<BettingOdds>,
    pub neutral_site: bool,
    pub conference_game: bool,
    pub postseason: bool,
    pub expected_possessions: Option<f64>,
}

impl From<UpcomingGameRow> for UpcomingGame {
    fn from(row: UpcomingGameRow) -> Self {
        let defaults = GameContext::default();
        UpcomingGame {
            game_id: row.game_id,
            home_team_id: row.home_team_id,
            away_team_id: row.away_team_id,
            game_date: row.game_date,
            context: GameContext {
                neutral_site: row.neutral_site,
                conference_game: row.conference_game,
                postseason: row.postseason,
                expected_possessions: row
                    .expected_possessions
                    .filter(|p| *p > 0.0)
                    .unwrap_or(defaults.expected_possessions),
                ..defaults
            },
            odds: row.odds.0,
        }
    }
}

/// Convert rows, setting aside any whose label vectors have the wrong shape.
fn collect_records(rows: Vec<GameLabelRow>) -> UnprocessedGames {
    let mut batch = UnprocessedGames::default();
    for row in rows {
        let game_id = row.game_id.clone();
        match row.into_record() {
            Ok(record) => batch.games.push(record),
            Err(e) => {
                warn!(game_id = %game_id, error = %e, "Malformed game label row");
                batch.rejected.push(GameFailure {
                    game_id,
                    error: e.to_string(),
                });
            }
        }
    }
    batch
}

#[derive(Debug, Clone)]
pub struct PgGameSource {
    pool: PgPool,
}

impl PgGameSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GameSource for PgGameSource {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<UnprocessedGames> {
        let sql = format!(
            "SELECT {GAME_LABEL_COLUMNS} FROM game_labels \
             WHERE processed = false AND failure_reason IS NULL \
             ORDER BY game_date, game_id LIMIT $1"
        );
        let rows = sqlx::query_as::<_, GameLabelRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(collect_records(rows))
    }

    async fn mark_processed(&self, game_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE game_labels SET processed = true WHERE game_id = $1 AND processed = false",
        )
        .bind(game_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, game_id: &str, reason: &str) -> Result<()> {
        sqlx::query("UPDATE game_labels SET failure_reason = $2 WHERE game_id = $1")
            .bind(game_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_upcoming(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<UpcomingGame>> {
        let rows = sqlx::query_as::<_, UpcomingGameRow>(
            r#"
            SELECT game_id, home_team_id, away_team_id, game_date, odds,
                   neutral_site, conference_game, postseason, expected_possessions
            FROM upcoming_games
            WHERE game_date BETWEEN $1 AND $2
            ORDER BY game_date, game_id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UpcomingGame::from).collect())
    }

    async fn fetch_training_samples(&self, limit: usize) -> Result<Vec<PretrainingSample>> {
        let sql = format!(
            "SELECT {GAME_LABEL_COLUMNS} FROM game_labels ORDER BY game_date, game_id LIMIT $1"
        );
        let rows = sqlx::query_as::<_, GameLabelRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let batch = collect_records(rows);
        let samples: Vec<PretrainingSample> = batch
            .games
            .iter()
            .flat_map(PretrainingSample::from_record)
            .collect();
        info!(
            samples = samples.len(),
            skipped_rows = batch.rejected.len(),
            "Loaded pretraining samples"
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> GameLabelRow {
        GameLabelRow {
            game_id: "g1".into(),
            home_team_id: "DUKE".into(),
            away_team_id: "UNC".into(),
            game_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            transition_probs_home: Json(vec![0.125; NUM_OUTCOMES]),
            transition_probs_away: Json(vec![0.125; NUM_OUTCOMES]),
            home_features: Json(vec![0.5; 80]),
            away_features: Json(vec![0.25; 40]),
            home_score: Some(81),
            away_score: Some(-1),
            neutral_site: true,
            conference_game: false,
            postseason: false,
            home_rest_days: Some(2),
            away_rest_days: None,
            processed: false,
        }
    }

    #[test]
    fn test_row_into_record() {
        let record = row().into_record().unwrap();
        assert_eq!(record.label.home_score, Some(81));
        assert_eq!(record.label.away_score, None);
        assert!(record.context.neutral_site);
        assert_eq!(record.context.home_rest_days, Some(2));
        assert_eq!(record.away_features.len(), 40);
    }

    #[test]
    fn test_malformed_label_rows_reported() {
        let mut bad = row();
        bad.game_id = "g2".into();
        bad.transition_probs_away = Json(vec![0.5, 0.5]);
        let batch = collect_records(vec![row(), bad]);
        assert_eq!(batch.games.len(), 1);
        assert_eq!(batch.games[0].label.game_id, "g1");
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].game_id, "g2");
        assert!(batch.rejected[0].error.contains("expected 8, got 2"));
    }

    #[test]
    fn test_upcoming_row_defaults_possessions() {
        let game: UpcomingGame = UpcomingGameRow {
            game_id: "u1".into(),
            home_team_id: "DUKE".into(),
            away_team_id: "UNC".into(),
            game_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            odds: Json(BettingOdds {
                home_moneyline: Some(-150),
                away_moneyline: Some(130),
                spread_line: None,
                home_spread_odds: None,
                away_spread_odds: None,
                total_line: None,
                over_odds: None,
                under_odds: None,
            }),
            neutral_site: false,
            conference_game: true,
            postseason: false,
            expected_possessions: Some(0.0),
        }
        .into();
        assert_eq!(game.context.expected_possessions, 70.0);
        assert_eq!(game.odds.home_moneyline, Some(-150));
    }
}
