//! JSON persistence for model weights.
//!
//! The encoder document is written once, frozen. Any later attempt to
//! write over a frozen document fails with `FrozenEncoderViolation`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::encoder::{EncoderWeights, FrozenEncoder};
use crate::error::{CoreError, Result};
use crate::outcome::OutcomeModelWeights;

pub const ENCODER_FILE: &str = "encoder_weights.json";
pub const OUTCOME_FILE: &str = "outcome_model_weights.json";

/// Weight documents under one directory.
#[derive(Debug, Clone)]
pub struct WeightsRepository {
    dir: PathBuf,
}

impl WeightsRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn encoder_path(&self) -> PathBuf {
        self.dir.join(ENCODER_FILE)
    }

    pub fn outcome_path(&self) -> PathBuf {
        self.dir.join(OUTCOME_FILE)
    }

    /// Read the encoder document without interpreting the frozen flag.
    pub fn read_encoder_weights(&self) -> Result<Option<EncoderWeights>> {
        read_json(&self.encoder_path())
    }

    /// Persist the encoder. Refused if a frozen document already exists.
    pub fn save_encoder(&self, weights: &EncoderWeights) -> Result<()> {
        if let Some(existing) = self.read_encoder_weights()? {
            if existing.frozen {
                return Err(CoreError::FrozenEncoderViolation(format!(
                    "{} already holds frozen encoder {}",
                    self.encoder_path().display(),
                    existing.model_version
                )));
            }
        }
        weights.validate()?;
        write_json(&self.encoder_path(), weights)?;
        info!(
            version = %weights.model_version,
            frozen = weights.frozen,
            path = %self.encoder_path().display(),
            "Saved encoder weights"
        );
        Ok(())
    }

    pub fn save_frozen_encoder(&self, encoder: &FrozenEncoder) -> Result<()> {
        self.save_encoder(encoder.weights())
    }

    /// Load the frozen encoder used for inference.
    pub fn load_frozen_encoder(&self) -> Result<FrozenEncoder> {
        let weights = self.read_encoder_weights()?.ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "no encoder weights at {}; run pretraining first",
                self.encoder_path().display()
            ))
        })?;
        FrozenEncoder::from_weights(weights)
    }

    pub fn save_outcome_model(&self, weights: &OutcomeModelWeights) -> Result<()> {
        weights.validate()?;
        write_json(&self.outcome_path(), weights)
    }

    /// Load the outcome model; a malformed document is reported and ignored.
    pub fn load_outcome_model(&self) -> Result<Option<OutcomeModelWeights>> {
        let weights: Option<OutcomeModelWeights> = match read_json(&self.outcome_path()) {
            Ok(w) => w,
            Err(CoreError::Serialization(e)) => {
                warn!(error = %e, "Outcome model weights unreadable, starting fresh");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match weights {
            Some(w) if w.validate().is_err() => {
                warn!(
                    version = %w.model_version,
                    "Outcome model weights have the wrong shape, starting fresh"
                );
                Ok(None)
            }
            other => Ok(other),
        }
    }
}

/// Where the processor persists the outcome model after each committed game.
pub trait ModelCheckpoint: Send + Sync {
    fn save_checkpoint(&self, weights: &OutcomeModelWeights) -> Result<()>;
}

impl ModelCheckpoint for WeightsRepository {
    fn save_checkpoint(&self, weights: &OutcomeModelWeights) -> Result<()> {
        self.save_outcome_model(weights)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temporary file so readers never see a half-written document.
fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, OutcomeModelConfig};
    use crate::encoder::ContrastiveEncoder;
    use crate::outcome::OutcomeTransitionModel;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hoopcast-{name}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn small_encoder() -> ContrastiveEncoder {
        let config = EncoderConfig {
            hidden_dims: vec![8],
            decoder_hidden_dims: vec![8],
            ..Default::default()
        };
        ContrastiveEncoder::new(&config, "v1")
    }

    #[test]
    fn test_frozen_encoder_round_trip() {
        let repo = WeightsRepository::new(temp_dir("enc"));
        let frozen = small_encoder().freeze();
        repo.save_frozen_encoder(&frozen).unwrap();

        let loaded = repo.load_frozen_encoder().unwrap();
        assert_eq!(loaded.fingerprint(), frozen.fingerprint());
        let features = vec![0.25; 80];
        assert_eq!(loaded.encode(&features).unwrap(), frozen.encode(&features).unwrap());
    }

    #[test]
    fn test_refuses_overwrite_of_frozen_document() {
        let repo = WeightsRepository::new(temp_dir("refuse"));
        repo.save_frozen_encoder(&small_encoder().freeze()).unwrap();

        let err = repo.save_encoder(&small_encoder().checkpoint()).unwrap_err();
        assert!(matches!(err, CoreError::FrozenEncoderViolation(_)));
    }

    #[test]
    fn test_unfrozen_checkpoint_can_be_replaced() {
        let repo = WeightsRepository::new(temp_dir("ckpt"));
        repo.save_encoder(&small_encoder().checkpoint()).unwrap();
        repo.save_encoder(&small_encoder().checkpoint()).unwrap();
        assert!(repo.load_frozen_encoder().is_err());
    }

    #[test]
    fn test_outcome_model_missing_or_corrupt() {
        let dir = temp_dir("outcome");
        let repo = WeightsRepository::new(&dir);
        assert!(repo.load_outcome_model().unwrap().is_none());

        let model = OutcomeTransitionModel::new(&OutcomeModelConfig::default(), "o1");
        repo.save_outcome_model(&model.to_weights()).unwrap();
        assert!(repo.load_outcome_model().unwrap().is_some());

        fs::write(repo.outcome_path(), "{not json").unwrap();
        assert!(repo.load_outcome_model().unwrap().is_none());
    }
}
