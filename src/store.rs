//! Per-user index state: vectors, the ordered chunk-id list and the dirty flag.

use std::{
    collections::{BTreeSet, HashSet},
    path::PathBuf,
    sync::Arc,
};

use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::{
    chunk_source::{ChunkId, ChunkSource},
    data_dir::IndexArtifacts,
    embedding::{Embedder, VectorBackendStatus},
    error::{Error, Result},
    lexical,
    persist,
    vector_index::VectorIndex,
};

/// Shared construction parameters for every store a manager creates.
#[derive(Clone)]
pub struct StoreSettings {
    pub indexes_dir: PathBuf,
    /// `None` disables the vector backend entirely.
    pub embedder: Option<Arc<dyn Embedder>>,
    pub source: Arc<dyn ChunkSource>,
    /// How many of the most recent chunks the lexical fallback scans.
    pub lexical_window: usize,
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("indexes_dir", &self.indexes_dir)
            .field("embedder", &self.embedder.as_ref().map(|e| e.model_id()))
            .field("lexical_window", &self.lexical_window)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorePhase {
    /// Nothing read from disk yet.
    Unloaded,
    /// In memory and matching what is persisted.
    Ready,
    /// Holds changes that are not persisted yet.
    Dirty,
    /// Retired by the cache; rejects further mutation.
    Evicted,
}

/// What `add_chunk` managed to do with a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// Embedded with a real model and indexed.
    Indexed(Vec<f32>),
    /// Indexed with a degraded vector; ranking will not use it.
    Degraded(Vec<f32>),
    /// Only the chunk id was recorded; no vector backend is available.
    Recorded,
}

impl AddOutcome {
    pub fn vector(&self) -> Option<&[f32]> {
        match self {
            Self::Indexed(v) | Self::Degraded(v) => Some(v),
            Self::Recorded => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Vector,
    Lexical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub text: String,
    pub method: SearchMethod,
}

/// Point-in-time description of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub user_id: String,
    pub phase: StorePhase,
    pub backend: VectorBackendStatus,
    pub chunks: usize,
    pub vectors: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    loaded: bool,
    evicted: bool,
    /// Purged: in-memory data was dropped and must not be reloaded.
    discarded: bool,
    dirty: bool,
    index: Option<VectorIndex>,
    /// Every chunk recorded for the user, in ingestion order. Unlike the
    /// index, this also covers chunks that never got a vector.
    chunk_ids: Vec<ChunkId>,
    recorded: HashSet<ChunkId>,
}

impl StoreState {
    fn phase(&self) -> StorePhase {
        if self.evicted {
            StorePhase::Evicted
        } else if !self.loaded {
            StorePhase::Unloaded
        } else if self.dirty {
            StorePhase::Dirty
        } else {
            StorePhase::Ready
        }
    }
}

/// One user's index. At most one live instance exists per user; the
/// [`IndexCacheManager`](crate::manager::IndexCacheManager) enforces that.
///
/// Reads (`search_similar`) share the lock; `add_chunk` and `flush` take it
/// exclusively, so a search never sees the index and the chunk-id list
/// out of step.
pub struct UserIndexStore {
    user_id: String,
    artifacts: IndexArtifacts,
    embedder: Option<Arc<dyn Embedder>>,
    status: VectorBackendStatus,
    source: Arc<dyn ChunkSource>,
    lexical_window: usize,
    state: RwLock<StoreState>,
}

impl UserIndexStore {
    /// Create an unloaded store. Nothing is read until first use.
    pub fn new(user_id: &str, settings: &StoreSettings) -> Self {
        Self {
            user_id: user_id.to_string(),
            artifacts: IndexArtifacts::for_user(&settings.indexes_dir, user_id),
            status: VectorBackendStatus::detect(settings.embedder.as_deref()),
            embedder: settings.embedder.clone(),
            source: Arc::clone(&settings.source),
            lexical_window: settings.lexical_window,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn backend_status(&self) -> VectorBackendStatus {
        self.status
    }

    pub fn artifacts(&self) -> &IndexArtifacts {
        &self.artifacts
    }

    pub async fn phase(&self) -> StorePhase {
        self.state.read().await.phase()
    }

    /// Number of chunks recorded, loading from disk if needed.
    pub async fn len(&self) -> usize {
        self.loaded_read().await.chunk_ids.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Describe the store without forcing a load.
    pub async fn summary(&self) -> StoreSummary {
        let state = self.state.read().await;
        StoreSummary {
            user_id: self.user_id.clone(),
            phase: state.phase(),
            backend: self.status,
            chunks: state.chunk_ids.len(),
            vectors: state.index.as_ref().map_or(0, VectorIndex::len),
        }
    }

    /// Embed `text` and append it to the index under `chunk_id`.
    ///
    /// On error nothing is recorded and the store stays consistent.
    pub async fn add_chunk(&self, chunk_id: ChunkId, text: &str) -> Result<AddOutcome> {
        let vector = match &self.embedder {
            Some(embedder) if self.status.has_index() => {
                Some(embed_blocking(embedder, text).await?)
            }
            _ => None,
        };

        let mut state = self.loaded_write().await;
        if state.evicted {
            return Err(Error::Evicted(self.user_id.clone()));
        }

        let outcome = match (vector, state.index.as_mut()) {
            (Some(vector), Some(index)) => {
                // Loading may already have embedded a chunk the document
                // store had recorded.
                if !index.contains(chunk_id) {
                    index.insert(chunk_id, &vector)?;
                }
                if self.status.trusts_vectors() {
                    AddOutcome::Indexed(vector)
                } else {
                    AddOutcome::Degraded(vector)
                }
            }
            _ => AddOutcome::Recorded,
        };

        // A list rebuilt from the document store may already hold this id.
        if state.recorded.insert(chunk_id) {
            state.chunk_ids.push(chunk_id);
        }
        state.dirty = true;
        Ok(outcome)
    }

    /// Rank this user's chunks against `query`.
    ///
    /// Uses vector similarity when the backend is trusted and the index has
    /// data, otherwise term overlap over the most recent chunks. Never fails;
    /// chunks whose text can no longer be found are skipped.
    pub async fn search_similar(&self, query: &str, k: usize) -> Vec<SearchHit> {
        if k == 0 {
            return Vec::new();
        }
        let state = self.loaded_read().await;

        if let Some(index) = state.index.as_ref().filter(|i| !i.is_empty())
            && self.status.trusts_vectors()
        {
            match self.vector_search(index, query, k).await {
                Ok(hits) => return hits,
                Err(e) => warn!(
                    user = %self.user_id,
                    error = %e,
                    "vector search failed, falling back to lexical"
                ),
            }
        } else {
            debug!(
                user = %self.user_id,
                backend = %self.status,
                "using lexical search"
            );
        }

        self.lexical_search(&state.chunk_ids, query, k)
    }

    async fn vector_search(
        &self,
        index: &VectorIndex,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            Error::BackendUnavailable("no embedder configured".to_string())
        })?;
        let query_vector = embed_blocking(embedder, query).await?;
        let neighbors = index.search(&query_vector, k)?;

        Ok(neighbors
            .into_iter()
            .filter_map(|n| {
                self.fetch_text(n.chunk_id).map(|text| SearchHit {
                    chunk_id: n.chunk_id,
                    score: n.score,
                    text,
                    method: SearchMethod::Vector,
                })
            })
            .collect())
    }

    fn lexical_search(&self, chunk_ids: &[ChunkId], query: &str, k: usize) -> Vec<SearchHit> {
        let start = chunk_ids.len().saturating_sub(self.lexical_window);
        let candidates = chunk_ids[start..]
            .iter()
            .filter_map(|&id| self.fetch_text(id).map(|text| (id, text)));

        lexical::rank(query, candidates, k)
            .into_iter()
            .map(|m| SearchHit {
                chunk_id: m.chunk_id,
                score: m.score,
                text: m.text,
                method: SearchMethod::Lexical,
            })
            .collect()
    }

    fn fetch_text(&self, chunk_id: ChunkId) -> Option<String> {
        match self.source.chunk_text(&self.user_id, chunk_id) {
            Ok(Some(text)) => Some(text),
            Ok(None) => {
                debug!(user = %self.user_id, chunk_id, "chunk not found, skipping");
                None
            }
            Err(e) => {
                warn!(
                    user = %self.user_id,
                    chunk_id,
                    error = %e,
                    "chunk lookup failed, skipping"
                );
                None
            }
        }
    }

    /// Persist the index and chunk-id list if anything changed.
    ///
    /// Returns `Ok(false)` when there was nothing to write. On failure the
    /// store stays dirty so a later flush can retry.
    pub async fn flush(&self) -> Result<bool> {
        let mut state = self.state.write().await;
        // An evicted store may still answer searches, but a newer instance
        // owns the files.
        if !state.loaded || !state.dirty || state.evicted {
            return Ok(false);
        }

        // Index first: the chunk-id list must never be newer than the blob.
        if let Some(index) = &state.index {
            persist::write_atomic(&self.artifacts.vectors, &index.to_bytes()).await?;
        }
        let ids = serde_json::to_vec(&state.chunk_ids)?;
        persist::write_atomic(&self.artifacts.chunk_ids, &ids).await?;

        state.dirty = false;
        debug!(
            user = %self.user_id,
            chunks = state.chunk_ids.len(),
            "flushed index"
        );
        Ok(true)
    }

    /// Mark the store evicted if nobody holds its lock.
    ///
    /// Returns `None` when the store is busy and `Some(false)` when it has
    /// unflushed changes and `force` is off. `Some(true)` means it is now
    /// evicted; with `force`, unflushed changes are abandoned.
    pub(crate) fn try_retire(&self, force: bool) -> Option<bool> {
        let mut state = self.state.try_write().ok()?;
        if state.loaded && state.dirty && !force {
            return Some(false);
        }
        state.evicted = true;
        Some(true)
    }

    /// Evict and drop all in-memory data without persisting it.
    pub(crate) async fn discard(&self) {
        let mut state = self.state.write().await;
        *state = StoreState {
            evicted: true,
            discarded: true,
            ..Default::default()
        };
    }

    async fn loaded_read(&self) -> RwLockReadGuard<'_, StoreState> {
        let guard = self.state.read().await;
        if guard.loaded || guard.discarded {
            return guard;
        }
        drop(guard);
        self.loaded_write().await.downgrade()
    }

    /// Exclusive access to loaded state.
    ///
    /// A store evicted before it was ever used still loads, read-only, so a
    /// caller holding it can search. It stays evicted and never flushes.
    async fn loaded_write(&self) -> RwLockWriteGuard<'_, StoreState> {
        let mut guard = self.state.write().await;
        if !guard.loaded && !guard.discarded {
            let evicted = guard.evicted;
            *guard = self.load(evicted).await;
            if evicted {
                guard.evicted = true;
                guard.dirty = false;
            }
        }
        guard
    }

    /// Read persisted state. Every failure degrades to a usable state
    /// instead of propagating.
    ///
    /// Unless `read_only`, recorded chunks without a vector are embedded
    /// again so the vector path covers every chunk.
    async fn load(&self, read_only: bool) -> StoreState {
        let mut state = StoreState {
            loaded: true,
            ..Default::default()
        };

        let embedder = self.embedder.as_ref().filter(|_| self.status.has_index());
        if let Some(embedder) = embedder {
            state.index = Some(match self.load_index(embedder.as_ref()).await {
                Some(index) => index,
                None => VectorIndex::new(embedder.model_id(), embedder.dimension()),
            });
        }

        let mut chunk_ids = match self.load_chunk_ids().await {
            Some(ids) => ids,
            None => {
                let rebuilt = self.rebuild_chunk_ids();
                state.dirty = !rebuilt.is_empty();
                rebuilt
            }
        };

        // A crash between the two writes leaves the blob ahead of the list.
        if let Some(index) = &state.index {
            let known: BTreeSet<ChunkId> = chunk_ids.iter().copied().collect();
            let missing: BTreeSet<ChunkId> = index
                .chunk_ids()
                .filter(|id| !known.contains(id))
                .collect();
            if !missing.is_empty() {
                debug!(
                    user = %self.user_id,
                    count = missing.len(),
                    "recovering chunk ids present only in the index"
                );
                chunk_ids.extend(missing);
                chunk_ids.sort_unstable();
                state.dirty = true;
            }
        }

        chunk_ids.dedup();
        state.recorded = chunk_ids.iter().copied().collect();
        state.chunk_ids = chunk_ids;

        if let (Some(embedder), Some(index), false) = (embedder, state.index.as_mut(), read_only)
            && self.backfill(embedder, index, &state.chunk_ids).await > 0
        {
            state.dirty = true;
        }

        debug!(
            user = %self.user_id,
            chunks = state.chunk_ids.len(),
            vectors = state.index.as_ref().map_or(0, VectorIndex::len),
            "loaded index"
        );
        state
    }

    /// Embed every chunk in `chunk_ids` that has no vector in `index`.
    /// Returns how many were added; chunks that fail are left out.
    async fn backfill(
        &self,
        embedder: &Arc<dyn Embedder>,
        index: &mut VectorIndex,
        chunk_ids: &[ChunkId],
    ) -> usize {
        let indexed: HashSet<ChunkId> = index.chunk_ids().collect();
        let mut added = 0;
        for &chunk_id in chunk_ids.iter().filter(|id| !indexed.contains(id)) {
            let Some(text) = self.fetch_text(chunk_id) else {
                continue;
            };
            let inserted = match embed_blocking(embedder, &text).await {
                Ok(vector) => index.insert(chunk_id, &vector).map(|_| ()),
                Err(e) => Err(e),
            };
            match inserted {
                Ok(()) => added += 1,
                Err(e) => warn!(
                    user = %self.user_id,
                    chunk_id,
                    error = %e,
                    "could not embed chunk missing from the index"
                ),
            }
        }
        if added > 0 {
            debug!(user = %self.user_id, count = added, "embedded chunks missing from the index");
        }
        added
    }

    async fn load_index(&self, embedder: &dyn Embedder) -> Option<VectorIndex> {
        let dimension = embedder.dimension();
        let bytes = match persist::read_optional(&self.artifacts.vectors).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "could not read index, starting empty");
                return None;
            }
        };

        match VectorIndex::from_bytes(&bytes) {
            Ok(index) if index.model_id() != embedder.model_id() => {
                warn!(
                    user = %self.user_id,
                    expected = embedder.model_id(),
                    found = index.model_id(),
                    "persisted index was built by another embedder, discarding"
                );
                None
            }
            Ok(index) if index.dimension() == dimension => Some(index),
            Ok(index) => {
                warn!(
                    user = %self.user_id,
                    expected = dimension,
                    found = index.dimension(),
                    "persisted index has a different dimension, discarding"
                );
                None
            }
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "persisted index is corrupt, starting empty");
                None
            }
        }
    }

    async fn load_chunk_ids(&self) -> Option<Vec<ChunkId>> {
        match persist::read_optional(&self.artifacts.chunk_ids).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(ids) => Some(ids),
                Err(e) => {
                    warn!(user = %self.user_id, error = %e, "chunk id list is corrupt, rebuilding");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "could not read chunk id list, rebuilding");
                None
            }
        }
    }

    fn rebuild_chunk_ids(&self) -> Vec<ChunkId> {
        match self.source.list_chunk_ids(&self.user_id) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "could not list chunks from document store");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for UserIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserIndexStore")
            .field("user_id", &self.user_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

async fn embed_blocking(embedder: &Arc<dyn Embedder>, text: &str) -> Result<Vec<f32>> {
    let embedder = Arc::clone(embedder);
    let text = text.to_string();
    tokio::task::spawn_blocking(move || embedder.embed(&text))
        .await
        .map_err(|e| Error::BackendUnavailable(format!("embedding task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::DegradedEmbedder,
        testing::{FixedEmbedder, MemoryChunks},
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        settings: StoreSettings,
        chunks: Arc<MemoryChunks>,
    }

    fn fixture(embedder: Option<Arc<dyn Embedder>>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let chunks = Arc::new(MemoryChunks::default());
        let settings = StoreSettings {
            indexes_dir: tmp.path().to_path_buf(),
            embedder,
            source: chunks.clone(),
            lexical_window: 200,
        };
        Fixture {
            _tmp: tmp,
            settings,
            chunks,
        }
    }

    async fn add(store: &UserIndexStore, chunks: &MemoryChunks, text: &str) -> ChunkId {
        let id = chunks.insert(store.user_id(), text);
        store.add_chunk(id, text).await.unwrap();
        id
    }

    fn toy_embedder() -> FixedEmbedder {
        let twin = [0.99_f32, (1.0_f32 - 0.99 * 0.99).sqrt(), 0.0, 0.0];
        FixedEmbedder::new(4)
            .with("north", &[1.0, 0.0, 0.0, 0.0])
            .with("east", &[0.0, 1.0, 0.0, 0.0])
            .with("south", &[0.0, 0.0, 1.0, 0.0])
            .with("west", &[0.0, 0.0, 0.0, 1.0])
            .with("almost north", &twin)
            .with("where is almost north", &twin)
    }

    #[tokio::test]
    async fn vector_search_on_toy_corpus() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);

        let north = add(&store, &fx.chunks, "north").await;
        let east = add(&store, &fx.chunks, "east").await;
        add(&store, &fx.chunks, "south").await;
        add(&store, &fx.chunks, "west").await;
        let twin = add(&store, &fx.chunks, "almost north").await;

        let hits = store.search_similar("where is almost north", 5).await;
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|h| h.method == SearchMethod::Vector));

        assert_eq!(hits[0].chunk_id, twin);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].chunk_id, north);
        assert!((hits[1].score - 0.99).abs() < 1e-5);
        assert_eq!(hits[2].chunk_id, east);
        assert!((hits[2].score - (1.0_f32 - 0.99 * 0.99).sqrt()).abs() < 1e-5);
        assert!(hits[3].score.abs() < 1e-6);
        assert_eq!(hits[0].text, "almost north");
    }

    #[tokio::test]
    async fn unavailable_backend_uses_lexical_overlap() {
        let fx = fixture(None);
        let store = UserIndexStore::new("alice", &fx.settings);
        assert_eq!(store.backend_status(), VectorBackendStatus::Unavailable);

        let cats = fx.chunks.insert("alice", "cats and dogs");
        let outcome = store.add_chunk(cats, "cats and dogs").await.unwrap();
        assert_eq!(outcome, AddOutcome::Recorded);
        assert!(outcome.vector().is_none());
        add(&store, &fx.chunks, "quantum physics").await;

        let hits = store.search_similar("cats", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, cats);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[0].method, SearchMethod::Lexical);
    }

    #[tokio::test]
    async fn degraded_embedder_indexes_but_searches_lexically() {
        let fx = fixture(Some(Arc::new(DegradedEmbedder::default())));
        let store = UserIndexStore::new("alice", &fx.settings);
        assert_eq!(store.backend_status(), VectorBackendStatus::Degraded);

        let id = fx.chunks.insert("alice", "cats and dogs");
        let outcome = store.add_chunk(id, "cats and dogs").await.unwrap();
        assert!(matches!(outcome, AddOutcome::Degraded(ref v) if v.len() == 384));
        add(&store, &fx.chunks, "quantum physics").await;

        let hits = store.search_similar("Quantum", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "quantum physics");
        assert_eq!(hits[0].method, SearchMethod::Lexical);
        assert_eq!(store.summary().await.vectors, 2);
    }

    #[tokio::test]
    async fn empty_index_falls_back_to_lexical() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let id = fx.chunks.insert("alice", "north pole expedition");
        let store = UserIndexStore::new("alice", &fx.settings);

        let hits = store.search_similar("north", 3).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, id);
        assert_eq!(hits[0].method, SearchMethod::Lexical);
    }

    #[tokio::test]
    async fn ids_already_rebuilt_are_not_duplicated() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);

        let id = fx.chunks.insert("alice", "north");
        store.add_chunk(id, "north").await.unwrap();

        let summary = store.summary().await;
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.vectors, 1);
    }

    #[tokio::test]
    async fn flush_twice_is_a_noop() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);
        add(&store, &fx.chunks, "north").await;
        assert_eq!(store.phase().await, StorePhase::Dirty);

        assert!(store.flush().await.unwrap());
        assert_eq!(store.phase().await, StorePhase::Ready);
        let blob = std::fs::read(&store.artifacts().vectors).unwrap();
        let ids = std::fs::read(&store.artifacts().chunk_ids).unwrap();

        assert!(!store.flush().await.unwrap());
        assert_eq!(std::fs::read(&store.artifacts().vectors).unwrap(), blob);
        assert_eq!(std::fs::read(&store.artifacts().chunk_ids).unwrap(), ids);
    }

    #[tokio::test]
    async fn reload_answers_like_before() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);
        for text in ["north", "east", "south", "almost north"] {
            add(&store, &fx.chunks, text).await;
        }
        let before = store.search_similar("where is almost north", 3).await;
        store.flush().await.unwrap();
        drop(store);

        let reloaded = UserIndexStore::new("alice", &fx.settings);
        assert_eq!(reloaded.phase().await, StorePhase::Unloaded);
        assert_eq!(reloaded.search_similar("where is almost north", 3).await, before);
        assert_eq!(reloaded.phase().await, StorePhase::Ready);
        assert_eq!(reloaded.len().await, 4);
    }

    #[tokio::test]
    async fn corrupt_blob_is_rebuilt_from_chunks() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);
        let north = add(&store, &fx.chunks, "north").await;
        store.flush().await.unwrap();
        std::fs::write(&store.artifacts().vectors, b"not an index").unwrap();
        drop(store);

        let reloaded = UserIndexStore::new("alice", &fx.settings);
        let hits = reloaded.search_similar("north", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, north);
        assert_eq!(hits[0].method, SearchMethod::Vector);

        let summary = reloaded.summary().await;
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.vectors, 1);
        assert_eq!(summary.phase, StorePhase::Dirty);
    }

    #[tokio::test]
    async fn unembeddable_chunks_stay_lexical_after_corrupt_blob() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let id = fx.chunks.insert("alice", "north pole expedition");
        let artifacts = IndexArtifacts::for_user(&fx.settings.indexes_dir, "alice");
        std::fs::write(&artifacts.vectors, b"not an index").unwrap();

        let reloaded = UserIndexStore::new("alice", &fx.settings);
        let hits = reloaded.search_similar("pole", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, id);
        assert_eq!(hits[0].method, SearchMethod::Lexical);
        assert_eq!(reloaded.summary().await.vectors, 0);
    }

    #[tokio::test]
    async fn chunks_recorded_without_vectors_are_embedded_on_load() {
        let fx = fixture(None);
        let store = UserIndexStore::new("alice", &fx.settings);
        let north = add(&store, &fx.chunks, "north").await;
        let east = add(&store, &fx.chunks, "east").await;
        store.flush().await.unwrap();
        drop(store);

        let mut settings = fx.settings.clone();
        settings.embedder = Some(Arc::new(toy_embedder()));
        let reloaded = UserIndexStore::new("alice", &settings);
        let south = add(&reloaded, &fx.chunks, "south").await;

        let summary = reloaded.summary().await;
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.vectors, 3);

        for (query, expected) in [("north", north), ("east", east), ("south", south)] {
            let hits = reloaded.search_similar(query, 1).await;
            assert_eq!(hits[0].chunk_id, expected);
            assert_eq!(hits[0].method, SearchMethod::Vector);
        }
    }

    #[tokio::test]
    async fn index_from_another_embedder_is_discarded() {
        let fx = fixture(Some(Arc::new(DegradedEmbedder::default())));
        let store = UserIndexStore::new("alice", &fx.settings);
        add(&store, &fx.chunks, "quantum physics").await;
        store.flush().await.unwrap();
        drop(store);

        // Same dimension as the degraded vectors, but a trusted model.
        let mut settings = fx.settings.clone();
        settings.embedder = Some(Arc::new(FixedEmbedder::new(384)));
        let reloaded = UserIndexStore::new("alice", &settings);
        assert_eq!(reloaded.backend_status(), VectorBackendStatus::Available);

        assert!(reloaded.search_similar("cats", 5).await.is_empty());
        let hits = reloaded.search_similar("quantum", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].method, SearchMethod::Lexical);
        assert_eq!(reloaded.summary().await.vectors, 0);
    }

    #[tokio::test]
    async fn missing_chunk_list_is_rebuilt_from_source() {
        let fx = fixture(None);
        let a = fx.chunks.insert("alice", "first chunk");
        let b = fx.chunks.insert("alice", "second chunk");
        fx.chunks.insert("bob", "not alice's");

        let store = UserIndexStore::new("alice", &fx.settings);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.phase().await, StorePhase::Dirty);

        let hits = store.search_similar("chunk", 5).await;
        let ids: Vec<_> = hits.iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn index_ids_missing_from_list_are_recovered() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);
        let north = add(&store, &fx.chunks, "north").await;
        store.flush().await.unwrap();
        let east = add(&store, &fx.chunks, "east").await;
        store.flush().await.unwrap();

        // Simulate a crash after the blob write but before the list write.
        std::fs::write(&store.artifacts().chunk_ids, format!("[{north}]")).unwrap();
        drop(store);

        let reloaded = UserIndexStore::new("alice", &fx.settings);
        assert_eq!(reloaded.len().await, 2);
        let hits = reloaded.search_similar("east", 1).await;
        assert_eq!(hits[0].chunk_id, east);
    }

    #[tokio::test]
    async fn dimension_change_reembeds_chunks() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);
        let north = add(&store, &fx.chunks, "north").await;
        store.flush().await.unwrap();
        drop(store);

        let mut settings = fx.settings.clone();
        settings.embedder = Some(Arc::new(FixedEmbedder::new(2).with("north", &[1.0, 0.0])));
        let reloaded = UserIndexStore::new("alice", &settings);

        assert_eq!(reloaded.len().await, 1);
        let summary = reloaded.summary().await;
        assert_eq!(summary.vectors, 1);
        assert_eq!(summary.chunks, 1);

        let hits = reloaded.search_similar("north", 1).await;
        assert_eq!(hits[0].chunk_id, north);
        assert_eq!(hits[0].method, SearchMethod::Vector);
    }

    #[tokio::test]
    async fn failed_embedding_records_nothing() {
        let embedder = toy_embedder().with("bad", &[1.0, 0.0]);
        let fx = fixture(Some(Arc::new(embedder)));
        let store = UserIndexStore::new("alice", &fx.settings);

        let err = store.add_chunk(1, "bad").await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 2 }));
        let err = store.add_chunk(2, "unknown text").await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));

        assert_eq!(store.len().await, 0);
        assert!(!store.flush().await.unwrap());
    }

    #[tokio::test]
    async fn missing_chunks_are_skipped() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = UserIndexStore::new("alice", &fx.settings);
        let north = add(&store, &fx.chunks, "north").await;
        let twin = add(&store, &fx.chunks, "almost north").await;
        fx.chunks.remove(twin);

        let hits = store.search_similar("where is almost north", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, north);
    }

    #[tokio::test]
    async fn lexical_search_only_scans_recent_window() {
        let mut fx = fixture(None);
        fx.settings.lexical_window = 2;
        let store = UserIndexStore::new("alice", &fx.settings);

        add(&store, &fx.chunks, "old apples").await;
        add(&store, &fx.chunks, "pears").await;
        let recent = add(&store, &fx.chunks, "new apples").await;

        let hits = store.search_similar("apples", 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, recent);
    }

    #[tokio::test]
    async fn failed_flush_keeps_store_dirty() {
        let mut fx = fixture(None);
        let indexes = fx._tmp.path().join("not-yet");
        fx.settings.indexes_dir = indexes.clone();
        let store = UserIndexStore::new("alice", &fx.settings);
        add(&store, &fx.chunks, "hello").await;

        let err = store.flush().await.unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        assert_eq!(store.phase().await, StorePhase::Dirty);

        std::fs::create_dir_all(&indexes).unwrap();
        assert!(store.flush().await.unwrap());
        assert_eq!(store.phase().await, StorePhase::Ready);
    }

    #[tokio::test]
    async fn evicted_store_rejects_mutation() {
        let fx = fixture(None);
        let store = UserIndexStore::new("alice", &fx.settings);
        add(&store, &fx.chunks, "kept").await;
        store.flush().await.unwrap();

        assert_eq!(store.try_retire(false), Some(true));
        assert_eq!(store.phase().await, StorePhase::Evicted);

        let err = store.add_chunk(99, "late").await.unwrap_err();
        assert!(matches!(err, Error::Evicted(ref user) if user == "alice"));
        assert_eq!(store.search_similar("kept", 1).await.len(), 1);
    }

    #[tokio::test]
    async fn dirty_store_refuses_to_retire() {
        let fx = fixture(None);
        let store = UserIndexStore::new("alice", &fx.settings);
        add(&store, &fx.chunks, "pending").await;

        assert_eq!(store.try_retire(false), Some(false));
        assert_eq!(store.phase().await, StorePhase::Dirty);
        assert_eq!(store.try_retire(true), Some(true));
        assert_eq!(store.phase().await, StorePhase::Evicted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_and_searches_stay_consistent() {
        let fx = fixture(Some(Arc::new(toy_embedder())));
        let store = Arc::new(UserIndexStore::new("alice", &fx.settings));
        let texts = ["north", "east", "south", "west"];

        let mut writers = Vec::new();
        for worker in 0..4 {
            let store = Arc::clone(&store);
            let chunks = Arc::clone(&fx.chunks);
            writers.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..25 {
                    let text = texts[(worker + i) % texts.len()];
                    let id = chunks.insert("alice", text);
                    store.add_chunk(id, text).await.unwrap();
                    ids.push(id);
                }
                ids
            }));
        }

        let mut readers = Vec::new();
        for worker in 0..4 {
            let store = Arc::clone(&store);
            readers.push(tokio::spawn(async move {
                for i in 0..25 {
                    let query = texts[(worker + i) % texts.len()];
                    for hit in store.search_similar(query, 5).await {
                        assert!(texts.contains(&hit.text.as_str()));
                    }
                    let summary = store.summary().await;
                    assert_eq!(summary.chunks, summary.vectors);
                }
            }));
        }

        let mut added = HashSet::new();
        for writer in writers {
            added.extend(writer.await.unwrap());
        }
        for reader in readers {
            reader.await.unwrap();
        }

        let summary = store.summary().await;
        assert_eq!(summary.chunks, 100);
        assert_eq!(summary.vectors, 100);
        for text in texts {
            for hit in store.search_similar(text, 10).await {
                assert!(added.contains(&hit.chunk_id));
                assert_eq!(hit.text, text);
                assert_eq!(hit.method, SearchMethod::Vector);
            }
        }
    }
}
