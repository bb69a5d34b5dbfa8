//! Bounded, time-expiring posterior cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::CacheConfig;
use crate::models::TeamPosterior;

/// Time source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    posterior: TeamPosterior,
    inserted_at: Instant,
}

pub struct PosteriorCache {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl PosteriorCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            ttl: config.ttl,
            capacity: config.capacity.max(1),
            clock,
        }
    }

    /// Fresh entry for `team_id`, if any. Expired entries read as absent.
    pub fn get(&self, team_id: &str) -> Option<TeamPosterior> {
        let now = self.clock.now();
        let entries = self.entries.read();
        entries
            .get(team_id)
            .filter(|e| now.duration_since(e.inserted_at) < self.ttl)
            .map(|e| e.posterior.clone())
    }

    pub fn insert(&self, posterior: TeamPosterior) {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        if !entries.contains_key(&posterior.team_id) && entries.len() >= self.capacity {
            entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(key) = oldest {
                    entries.remove(&key);
                }
            }
        }
        entries.insert(
            posterior.team_id.clone(),
            CacheEntry {
                posterior,
                inserted_at: now,
            },
        );
    }

    /// Drop only `team_id`'s entry.
    pub fn invalidate(&self, team_id: &str) {
        self.entries.write().remove(team_id);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for PosteriorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosteriorCache")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn posterior(id: &str) -> TeamPosterior {
        TeamPosterior::new_default(id, 1.0, Utc::now())
    }

    fn cache(capacity: usize) -> (PosteriorCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            ttl: Duration::from_secs(60),
            capacity,
        };
        (PosteriorCache::with_clock(&config, clock.clone()), clock)
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let (cache, clock) = cache(8);
        cache.insert(posterior("A"));
        clock.advance(Duration::from_secs(59));
        assert!(cache.get("A").is_some());
        clock.advance(Duration::from_secs(1));
        assert!(cache.get("A").is_none());
    }

    #[test]
    fn test_oldest_entry_evicted_at_capacity() {
        let (cache, clock) = cache(2);
        cache.insert(posterior("A"));
        clock.advance(Duration::from_secs(1));
        cache.insert(posterior("B"));
        clock.advance(Duration::from_secs(1));
        cache.insert(posterior("C"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("A").is_none());
        assert!(cache.get("B").is_some());
        assert!(cache.get("C").is_some());
    }

    #[test]
    fn test_invalidate_is_per_key() {
        let (cache, _) = cache(8);
        cache.insert(posterior("A"));
        cache.insert(posterior("B"));
        cache.invalidate("A");
        assert!(cache.get("A").is_none());
        assert!(cache.get("B").is_some());
    }

    #[test]
    fn test_expired_entries_purged_before_eviction() {
        let (cache, clock) = cache(2);
        cache.insert(posterior("A"));
        clock.advance(Duration::from_secs(30));
        cache.insert(posterior("B"));
        clock.advance(Duration::from_secs(31));
        // A has expired; inserting C should drop A, not B
        cache.insert(posterior("C"));
        assert!(cache.get("B").is_some());
        assert!(cache.get("C").is_some());
    }
}
