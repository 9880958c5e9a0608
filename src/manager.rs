//! Bounded LRU registry of per-user index stores.
//!
//! All bookkeeping (lookup-or-create, recency, victim selection) happens
//! under one async mutex. Flushing never does: an evicted store first moves
//! to a draining set, is flushed with only its own lock held, and is retired
//! once it is clean. Asking for a draining user hands back that same
//! instance, so two stores for one user never coexist.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    chunk_source::ChunkSource,
    config::ServiceConfig,
    data_dir::{DataDir, IndexArtifacts},
    embedding::{Embedder, VectorBackendStatus, load_embedder},
    error::{Error, Result},
    persist,
    store::{StoreSettings, UserIndexStore},
};

/// First and longest pause between retire attempts on a busy store.
const RETIRE_BACKOFF_START: Duration = Duration::from_millis(1);
const RETIRE_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Result of an explicit [`IndexCacheManager::evict`].
#[derive(Debug)]
pub enum EvictOutcome {
    /// The user had no live store.
    NotCached,
    /// The store was flushed and retired.
    Persisted,
    /// The flush failed; the store was retired anyway and its unflushed
    /// changes are lost.
    Dropped(Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub user_id: String,
    /// Number of `get_store` calls that returned this store.
    pub hits: u64,
    /// Manager tick of the most recent access.
    pub last_access: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub active_count: usize,
    pub capacity: usize,
    /// Evicted stores whose flush has not finished yet.
    pub draining: usize,
    /// Total stores constructed since startup.
    pub stores_created: u64,
    pub evictions: u64,
    pub backend: VectorBackendStatus,
    /// Live stores, most recently used first.
    pub users: Vec<UserStats>,
}

struct Entry {
    store: Arc<UserIndexStore>,
    hits: u64,
    last_tick: u64,
}

#[derive(Default)]
struct CacheState {
    tick: u64,
    live: HashMap<String, Entry>,
    draining: HashMap<String, Entry>,
    stores_created: u64,
    evictions: u64,
}

impl CacheState {
    fn is_draining(&self, user_id: &str, store: &Arc<UserIndexStore>) -> bool {
        self.draining
            .get(user_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.store, store))
    }

    /// Move least recently used entries to the draining set until at most
    /// `capacity` remain live.
    fn evict_over_capacity(&mut self, capacity: usize) -> Vec<(String, Arc<UserIndexStore>)> {
        let mut victims = Vec::new();
        while self.live.len() > capacity {
            let Some(user_id) = self
                .live
                .iter()
                .min_by(|(a_id, a), (b_id, b)| {
                    a.last_tick.cmp(&b.last_tick).then_with(|| a_id.cmp(b_id))
                })
                .map(|(user_id, _)| user_id.clone())
            else {
                break;
            };
            if let Some(entry) = self.live.remove(&user_id) {
                victims.push((user_id.clone(), Arc::clone(&entry.store)));
                self.draining.insert(user_id, entry);
            }
        }
        victims
    }
}

/// Owns every live [`UserIndexStore`] and bounds how many exist at once.
pub struct IndexCacheManager {
    settings: StoreSettings,
    capacity: usize,
    backend: VectorBackendStatus,
    cache: Mutex<CacheState>,
}

impl IndexCacheManager {
    /// Create a manager holding at most `capacity` stores (minimum 1).
    pub fn new(settings: StoreSettings, capacity: usize) -> Self {
        Self {
            backend: VectorBackendStatus::detect(settings.embedder.as_deref()),
            settings,
            capacity: capacity.max(1),
            cache: Mutex::new(CacheState::default()),
        }
    }

    /// Build a manager for `data_dir`, loading the embedding model when
    /// vectors are enabled.
    pub fn open(
        data_dir: &DataDir,
        config: &ServiceConfig,
        source: Arc<dyn ChunkSource>,
    ) -> Result<Self> {
        let embedder: Option<Arc<dyn Embedder>> = if config.vectors {
            Some(load_embedder(&config.model))
        } else {
            info!("vector backend disabled, using lexical search only");
            None
        };

        let settings = StoreSettings {
            indexes_dir: data_dir.indexes_dir()?,
            embedder,
            source,
            lexical_window: config.lexical_window,
        };
        Ok(Self::new(settings, config.max_services))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backend_status(&self) -> VectorBackendStatus {
        self.backend
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// The live store for `user_id`, created if absent.
    ///
    /// Creating a store may push the least recently used one out; that store
    /// is flushed before this returns.
    pub async fn get_store(&self, user_id: &str) -> Arc<UserIndexStore> {
        let (store, victims) = {
            let mut cache = self.cache.lock().await;
            cache.tick += 1;
            let tick = cache.tick;

            if let Some(entry) = cache.live.get_mut(user_id) {
                entry.hits += 1;
                entry.last_tick = tick;
                return Arc::clone(&entry.store);
            }

            let mut entry = match cache.draining.remove(user_id) {
                Some(entry) => {
                    debug!(user = user_id, "reinstating store that was being evicted");
                    entry
                }
                None => {
                    cache.stores_created += 1;
                    debug!(user = user_id, "creating index store");
                    Entry {
                        store: Arc::new(UserIndexStore::new(user_id, &self.settings)),
                        hits: 0,
                        last_tick: tick,
                    }
                }
            };
            entry.hits += 1;
            entry.last_tick = tick;

            let store = Arc::clone(&entry.store);
            cache.live.insert(user_id.to_string(), entry);
            let victims = cache.evict_over_capacity(self.capacity);
            (store, victims)
        };

        for (victim_id, victim) in victims {
            debug!(user = %victim_id, "evicting least recently used store");
            if let Some(e) = self.retire(&victim_id, victim).await {
                warn!(
                    user = %victim_id,
                    error = %e,
                    "flush failed during eviction, unflushed changes dropped"
                );
            }
        }
        store
    }

    /// Flush and remove `user_id`'s store.
    pub async fn evict(&self, user_id: &str) -> EvictOutcome {
        let store = {
            let mut cache = self.cache.lock().await;
            let Some(entry) = cache.live.remove(user_id) else {
                return EvictOutcome::NotCached;
            };
            let store = Arc::clone(&entry.store);
            cache.draining.insert(user_id.to_string(), entry);
            store
        };

        match self.retire(user_id, store).await {
            None => EvictOutcome::Persisted,
            Some(e) => {
                warn!(user = user_id, error = %e, "flush failed during eviction");
                EvictOutcome::Dropped(e)
            }
        }
    }

    /// Flush `store` until it can be retired, or retire it unflushed if
    /// flushing fails. Returns the flush error in the latter case.
    ///
    /// Stops early if the store was reinstated by `get_store` meanwhile.
    async fn retire(&self, user_id: &str, store: Arc<UserIndexStore>) -> Option<Error> {
        let mut failure = None;
        let mut backoff = RETIRE_BACKOFF_START;
        loop {
            if failure.is_none()
                && let Err(e) = store.flush().await
            {
                failure = Some(e);
            }

            {
                let mut cache = self.cache.lock().await;
                if !cache.is_draining(user_id, &store) {
                    debug!(user = user_id, "store reinstated while draining");
                    return failure;
                }
                // Busy or dirtied again since the flush: go around.
                if store.try_retire(failure.is_some()) == Some(true) {
                    cache.draining.remove(user_id);
                    cache.evictions += 1;
                    return failure;
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RETIRE_BACKOFF_MAX);
        }
    }

    /// Remove `user_id`'s store without flushing and delete its persisted
    /// artifacts. Returns whether any artifact was deleted.
    pub async fn purge(&self, user_id: &str) -> Result<bool> {
        let stores: Vec<Arc<UserIndexStore>> = {
            let mut cache = self.cache.lock().await;
            [cache.live.remove(user_id), cache.draining.remove(user_id)]
                .into_iter()
                .flatten()
                .map(|entry| entry.store)
                .collect()
        };
        for store in &stores {
            store.discard().await;
        }

        let artifacts = IndexArtifacts::for_user(&self.settings.indexes_dir, user_id);
        let removed_vectors = persist::remove_if_exists(&artifacts.vectors).await?;
        let removed_ids = persist::remove_if_exists(&artifacts.chunk_ids).await?;
        info!(user = user_id, "purged index");
        Ok(removed_vectors || removed_ids)
    }

    /// Flush every live and draining store. Returns the failures.
    pub async fn flush_all(&self) -> Vec<(String, Error)> {
        let stores: Vec<Arc<UserIndexStore>> = {
            let cache = self.cache.lock().await;
            cache
                .live
                .values()
                .chain(cache.draining.values())
                .map(|entry| Arc::clone(&entry.store))
                .collect()
        };

        let mut failures = Vec::new();
        for store in stores {
            if let Err(e) = store.flush().await {
                warn!(user = store.user_id(), error = %e, "flush failed");
                failures.push((store.user_id().to_string(), e));
            }
        }
        failures
    }

    /// Flush and retire every store. Returns the users whose flush failed.
    pub async fn shutdown(&self) -> Vec<(String, Error)> {
        let users: Vec<String> = {
            let mut cache = self.cache.lock().await;
            let live: Vec<(String, Entry)> = cache.live.drain().collect();
            cache.draining.extend(live);
            cache.draining.keys().cloned().collect()
        };

        let mut failures = Vec::new();
        for user_id in users {
            let store = {
                let cache = self.cache.lock().await;
                match cache.draining.get(&user_id) {
                    Some(entry) => Arc::clone(&entry.store),
                    None => continue,
                }
            };
            if let Some(e) = self.retire(&user_id, store).await {
                warn!(user = %user_id, error = %e, "flush failed at shutdown");
                failures.push((user_id, e));
            }
        }
        info!(failed = failures.len(), "index cache shut down");
        failures
    }

    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.lock().await;
        let mut users: Vec<UserStats> = cache
            .live
            .iter()
            .map(|(user_id, entry)| UserStats {
                user_id: user_id.clone(),
                hits: entry.hits,
                last_access: entry.last_tick,
            })
            .collect();
        users.sort_by(|a, b| b.last_access.cmp(&a.last_access));

        CacheStats {
            active_count: cache.live.len(),
            capacity: self.capacity,
            draining: cache.draining.len(),
            stores_created: cache.stores_created,
            evictions: cache.evictions,
            backend: self.backend,
            users,
        }
    }
}

impl std::fmt::Debug for IndexCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCacheManager")
            .field("capacity", &self.capacity)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
