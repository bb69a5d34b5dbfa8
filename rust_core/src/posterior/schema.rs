//! Versioned posterior documents.
//!
//! Stored JSON is either the current tagged `bayesian_posterior_v1` shape or
//! the older untagged `{latent, games_played}` shape. Both are decoded here
//! and nowhere else; callers only ever see a validated [`TeamPosterior`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bayes::confidence;
use crate::config::BayesianConfig;
use crate::error::{CoreError, Result};
use crate::models::{SeasonTransitionRecord, TeamPosterior, LATENT_DIM};

pub const POSTERIOR_V1_TAG: &str = "bayesian_posterior_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorV1 {
    pub mu: Vec<f64>,
    pub sigma: Vec<f64>,
    pub games_processed: u32,
    #[serde(default)]
    pub last_season: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub season_transition_history: Vec<SeasonTransitionRecord>,
    #[serde(default)]
    pub recent_game_ids: Vec<String>,
}

/// Pre-Bayesian format: a point estimate with no uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyPosterior {
    pub latent: Vec<f64>,
    #[serde(default)]
    pub games_played: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoredPosterior {
    #[serde(rename = "bayesian_posterior_v1")]
    V1(PosteriorV1),
    #[serde(rename = "legacy")]
    Legacy(LegacyPosterior),
}

impl StoredPosterior {
    /// Identify the document shape. Untagged documents are recognised by
    /// their fields.
    pub fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "posterior document is not an object".to_string())?;
        if obj.contains_key("type") {
            return serde_json::from_value(value.clone()).map_err(|e| e.to_string());
        }
        if obj.contains_key("latent") {
            return serde_json::from_value(value.clone())
                .map(StoredPosterior::Legacy)
                .map_err(|e| e.to_string());
        }
        if obj.contains_key("mu") && obj.contains_key("sigma") {
            return serde_json::from_value(value.clone())
                .map(StoredPosterior::V1)
                .map_err(|e| e.to_string());
        }
        Err("unrecognised posterior document".to_string())
    }

    /// Migrate to the current model and validate it.
    pub fn into_posterior(
        self,
        team_id: &str,
        config: &BayesianConfig,
    ) -> std::result::Result<TeamPosterior, String> {
        let posterior = match self {
            StoredPosterior::V1(v1) => TeamPosterior {
                team_id: team_id.to_string(),
                mu: to_latent(&v1.mu, "mu")?,
                sigma: to_latent(&v1.sigma, "sigma")?,
                games_processed: v1.games_processed,
                confidence: v1.confidence,
                last_season: v1.last_season,
                last_updated: v1.last_updated,
                transition_history: v1.season_transition_history,
                recent_game_ids: v1.recent_game_ids,
            },
            StoredPosterior::Legacy(legacy) => TeamPosterior {
                team_id: team_id.to_string(),
                mu: to_latent(&legacy.latent, "latent")?,
                sigma: [config.initial_uncertainty; LATENT_DIM],
                games_processed: legacy.games_played,
                confidence: confidence(legacy.games_played, config),
                last_season: String::new(),
                last_updated: legacy.last_updated.unwrap_or_else(Utc::now),
                transition_history: Vec::new(),
                recent_game_ids: Vec::new(),
            },
        };
        posterior.check_structure()?;
        Ok(repair_bounds(posterior, config))
    }
}

impl From<&TeamPosterior> for StoredPosterior {
    fn from(p: &TeamPosterior) -> Self {
        StoredPosterior::V1(PosteriorV1 {
            mu: p.mu.to_vec(),
            sigma: p.sigma.to_vec(),
            games_processed: p.games_processed,
            last_season: p.last_season.clone(),
            last_updated: p.last_updated,
            confidence: p.confidence,
            season_transition_history: p.transition_history.clone(),
            recent_game_ids: p.recent_game_ids.clone(),
        })
    }
}

fn to_latent(values: &[f64], field: &str) -> std::result::Result<[f64; LATENT_DIM], String> {
    if values.len() != LATENT_DIM {
        return Err(format!("{field} has {} entries, expected {LATENT_DIM}", values.len()));
    }
    let mut out = [0.0; LATENT_DIM];
    out.copy_from_slice(values);
    Ok(out)
}

/// Pull σ back inside the configured bounds.
fn repair_bounds(mut posterior: TeamPosterior, config: &BayesianConfig) -> TeamPosterior {
    for s in posterior.sigma.iter_mut() {
        *s = s.clamp(config.min_uncertainty, config.max_uncertainty);
    }
    posterior
}

/// Decode a stored document for `team_id`.
pub fn decode_posterior(
    team_id: &str,
    value: &Value,
    config: &BayesianConfig,
) -> Result<TeamPosterior> {
    StoredPosterior::from_value(value)
        .and_then(|stored| stored.into_posterior(team_id, config))
        .map_err(|reason| CoreError::InvalidPosteriorFormat {
            team_id: team_id.to_string(),
            reason,
        })
}

/// Encode in the current tagged format.
pub fn encode_posterior(posterior: &TeamPosterior) -> Result<Value> {
    Ok(serde_json::to_value(StoredPosterior::from(posterior))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> BayesianConfig {
        BayesianConfig::default()
    }

    #[test]
    fn test_v1_round_trip_carries_tag() {
        let mut p = TeamPosterior::new_default("UCLA", 1.0, Utc::now());
        p.mu[3] = 0.7;
        p.games_processed = 12;
        p.last_season = "2024-25".into();
        p.record_game("g-2024-11-04");
        let value = encode_posterior(&p).unwrap();
        assert_eq!(value["type"], POSTERIOR_V1_TAG);
        assert!(value.get("season_transition_history").is_some());
        assert_eq!(value["recent_game_ids"][0], "g-2024-11-04");

        let decoded = decode_posterior("UCLA", &value, &config()).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn test_legacy_migrates_with_initial_uncertainty() {
        let value = json!({ "latent": vec![0.25; LATENT_DIM], "games_played": 9 });
        let p = decode_posterior("ARIZ", &value, &config()).unwrap();
        assert_eq!(p.mu, [0.25; LATENT_DIM]);
        assert_eq!(p.sigma, [1.0; LATENT_DIM]);
        assert_eq!(p.games_processed, 9);
        assert!(p.confidence > 0.0);
        assert!(p.last_season.is_empty());
    }

    #[test]
    fn test_malformed_documents_rejected() {
        let cfg = config();
        let short = json!({ "type": POSTERIOR_V1_TAG, "mu": vec![0.0; 3], "sigma": vec![1.0; 3],
            "games_processed": 1, "last_updated": "2024-01-01T00:00:00Z" });
        let zero_sigma = json!({ "type": POSTERIOR_V1_TAG, "mu": vec![0.0; LATENT_DIM],
            "sigma": vec![0.0; LATENT_DIM], "games_processed": 1,
            "last_updated": "2024-01-01T00:00:00Z" });
        let unknown_tag = json!({ "type": "something_else" });
        for doc in [short, zero_sigma, unknown_tag, json!("text"), json!({"foo": 1})] {
            let err = decode_posterior("X", &doc, &cfg).unwrap_err();
            assert!(matches!(err, CoreError::InvalidPosteriorFormat { .. }));
        }
    }

    #[test]
    fn test_out_of_bounds_sigma_repaired() {
        let value = json!({ "type": POSTERIOR_V1_TAG, "mu": vec![0.0; LATENT_DIM],
            "sigma": vec![5.0; LATENT_DIM], "games_processed": 3,
            "last_updated": "2024-01-01T00:00:00Z" });
        let p = decode_posterior("X", &value, &config()).unwrap();
        assert!(p.sigma.iter().all(|s| *s == 2.0));
    }
}
