//! Posterior store: validated reads, atomic writes, cache in front.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BayesianConfig;
use crate::error::{CoreError, Result};
use crate::models::TeamPosterior;

use super::cache::PosteriorCache;
use super::schema::{decode_posterior, encode_posterior};

/// Durable storage of raw posterior documents keyed by team id.
#[async_trait]
pub trait PosteriorBackend: Send + Sync {
    async fn load(&self, team_id: &str) -> Result<Option<Value>>;

    async fn load_many(&self, team_ids: &[String]) -> Result<HashMap<String, Value>>;

    /// Write every document or none of them.
    async fn save_many(&self, documents: &[(String, Value)]) -> Result<()>;
}

/// Process-local backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    documents: RwLock<FxHashMap<String, Value>>,
    failing_saves: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw document, bypassing validation.
    pub fn insert_raw(&self, team_id: &str, document: Value) {
        self.documents.write().insert(team_id.to_string(), document);
    }

    pub fn raw(&self, team_id: &str) -> Option<Value> {
        self.documents.read().get(team_id).cloned()
    }

    /// Make the next `count` saves fail with a transient storage error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl PosteriorBackend for InMemoryBackend {
    async fn load(&self, team_id: &str) -> Result<Option<Value>> {
        Ok(self.raw(team_id))
    }

    async fn load_many(&self, team_ids: &[String]) -> Result<HashMap<String, Value>> {
        let documents = self.documents.read();
        Ok(team_ids
            .iter()
            .filter_map(|id| documents.get(id).map(|d| (id.clone(), d.clone())))
            .collect())
    }

    async fn save_many(&self, documents: &[(String, Value)]) -> Result<()> {
        let injected = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoreError::Storage("connection reset by peer".to_string()));
        }
        let mut store = self.documents.write();
        for (team_id, doc) in documents {
            store.insert(team_id.clone(), doc.clone());
        }
        Ok(())
    }
}

/// Single owner of team posterior persistence.
#[derive(Clone)]
pub struct PosteriorStore {
    backend: Arc<dyn PosteriorBackend>,
    cache: Arc<PosteriorCache>,
    config: BayesianConfig,
}

impl PosteriorStore {
    pub fn new(
        backend: Arc<dyn PosteriorBackend>,
        cache: Arc<PosteriorCache>,
        config: BayesianConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &PosteriorCache {
        &self.cache
    }

    fn default_posterior(&self, team_id: &str) -> TeamPosterior {
        TeamPosterior::new_default(team_id, self.config.initial_uncertainty, Utc::now())
    }

    /// Decode, logging and discarding invalid documents.
    fn decode_or_discard(&self, team_id: &str, document: &Value) -> Option<TeamPosterior> {
        match decode_posterior(team_id, document, &self.config) {
            Ok(posterior) => Some(posterior),
            Err(e) => {
                warn!(team_id, error = %e, "Discarding stored posterior");
                None
            }
        }
    }

    /// Stored posterior, or `None` if absent or invalid.
    pub async fn get_existing(&self, team_id: &str) -> Result<Option<TeamPosterior>> {
        if let Some(hit) = self.cache.get(team_id) {
            return Ok(Some(hit));
        }
        let Some(document) = self.backend.load(team_id).await? else {
            return Ok(None);
        };
        let posterior = self.decode_or_discard(team_id, &document);
        if let Some(p) = &posterior {
            self.cache.insert(p.clone());
        }
        Ok(posterior)
    }

    /// Stored posterior, or the default prior when none is usable.
    pub async fn get(&self, team_id: &str) -> Result<TeamPosterior> {
        Ok(match self.get_existing(team_id).await? {
            Some(p) => p,
            None => {
                debug!(team_id, "No stored posterior, using default prior");
                self.default_posterior(team_id)
            }
        })
    }

    /// Posteriors for every requested team, defaults filled in.
    pub async fn batch_get(&self, team_ids: &[String]) -> Result<HashMap<String, TeamPosterior>> {
        let mut out = HashMap::with_capacity(team_ids.len());
        let mut missing = Vec::new();
        for id in team_ids {
            match self.cache.get(id) {
                Some(p) => {
                    out.insert(id.clone(), p);
                }
                None => missing.push(id.clone()),
            }
        }

        if !missing.is_empty() {
            let documents = self.backend.load_many(&missing).await?;
            for id in missing {
                let posterior = documents
                    .get(&id)
                    .and_then(|doc| self.decode_or_discard(&id, doc));
                match posterior {
                    Some(p) => {
                        self.cache.insert(p.clone());
                        out.insert(id, p);
                    }
                    None => {
                        let p = self.default_posterior(&id);
                        out.insert(id, p);
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn save(&self, posterior: &TeamPosterior) -> Result<()> {
        self.save_many(std::slice::from_ref(posterior)).await
    }

    /// Validate and write all posteriors atomically; on success invalidate
    /// exactly the written keys.
    pub async fn save_many(&self, posteriors: &[TeamPosterior]) -> Result<()> {
        let mut documents = Vec::with_capacity(posteriors.len());
        for p in posteriors {
            p.check_structure()
                .map_err(|reason| CoreError::InvalidPosteriorFormat {
                    team_id: p.team_id.clone(),
                    reason,
                })?;
            documents.push((p.team_id.clone(), encode_posterior(p)?));
        }
        self.backend.save_many(&documents).await?;
        for p in posteriors {
            self.cache.invalidate(&p.team_id);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PosteriorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosteriorStore")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::models::LATENT_DIM;
    use serde_json::json;

    fn store() -> (PosteriorStore, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = Arc::new(PosteriorCache::new(&CacheConfig::default()));
        let store = PosteriorStore::new(backend.clone(), cache, BayesianConfig::default());
        (store, backend)
    }

    #[tokio::test]
    async fn test_missing_team_gets_default() {
        let (store, _) = store();
        let p = store.get("NEW").await.unwrap();
        assert_eq!(p.games_processed, 0);
        assert_eq!(p.mu, [0.0; LATENT_DIM]);
        assert_eq!(p.sigma, [1.0; LATENT_DIM]);
        assert!(store.get_existing("NEW").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_get_round_trips() {
        let (store, _) = store();
        let mut p = TeamPosterior::new_default("DUKE", 1.0, Utc::now());
        p.mu[0] = 0.4;
        p.games_processed = 3;
        store.save(&p).await.unwrap();
        assert_eq!(store.get("DUKE").await.unwrap(), p);
    }

    #[tokio::test]
    async fn test_write_invalidates_only_written_key() {
        let (store, _) = store();
        let a = TeamPosterior::new_default("A", 1.0, Utc::now());
        let b = TeamPosterior::new_default("B", 1.0, Utc::now());
        store.save_many(&[a.clone(), b.clone()]).await.unwrap();
        store.get("A").await.unwrap();
        store.get("B").await.unwrap();
        assert_eq!(store.cache().len(), 2);

        let mut a2 = a.clone();
        a2.games_processed = 1;
        store.save(&a2).await.unwrap();
        assert!(store.cache().get("A").is_none());
        assert!(store.cache().get("B").is_some());
        assert_eq!(store.get("A").await.unwrap().games_processed, 1);
    }

    #[tokio::test]
    async fn test_invalid_documents_treated_as_absent() {
        let (store, backend) = store();
        backend.insert_raw("BAD", json!({ "mu": [1.0, 2.0], "sigma": [1.0] }));
        let p = store.get("BAD").await.unwrap();
        assert_eq!(p.games_processed, 0);

        let all = store
            .batch_get(&["BAD".to_string(), "NONE".to_string()])
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.values().all(|p| p.games_processed == 0));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_nothing_written() {
        let (store, backend) = store();
        backend.fail_next_saves(1);
        let a = TeamPosterior::new_default("A", 1.0, Utc::now());
        let b = TeamPosterior::new_default("B", 1.0, Utc::now());
        let err = store.save_many(&[a, b]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_structurally_invalid_write() {
        let (store, backend) = store();
        let mut p = TeamPosterior::new_default("A", 1.0, Utc::now());
        p.sigma[4] = -1.0;
        assert!(store.save(&p).await.is_err());
        assert!(backend.is_empty());
    }
}
