//! In-memory collaborators for unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    chunk_source::{ChunkId, ChunkSource},
    embedding::{Embedder, normalize},
    error::{Error, Result},
};

/// Chunk rows kept in a map, with ids allocated like the real document store.
#[derive(Debug, Default)]
pub struct MemoryChunks {
    next_id: AtomicU64,
    rows: Mutex<BTreeMap<ChunkId, (String, String)>>,
}

impl MemoryChunks {
    pub fn insert(&self, owner: &str, text: &str) -> ChunkId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows
            .lock()
            .unwrap()
            .insert(id, (owner.to_string(), text.to_string()));
        id
    }

    pub fn remove(&self, id: ChunkId) {
        self.rows.lock().unwrap().remove(&id);
    }
}

impl ChunkSource for MemoryChunks {
    fn chunk_text(&self, owner: &str, chunk_id: ChunkId) -> Result<Option<String>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&chunk_id)
            .filter(|(o, _)| o == owner)
            .map(|(_, text)| text.clone()))
    }

    fn list_chunk_ids(&self, owner: &str) -> Result<Vec<ChunkId>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (o, _))| o == owner)
            .map(|(id, _)| *id)
            .collect())
    }
}

/// Embedder that maps known texts to hand-picked vectors.
///
/// Vectors are normalized on the way out but their length is not checked,
/// so a test can register a wrong-sized vector on purpose. Unknown texts
/// fail with `BackendUnavailable`.
#[derive(Debug, Clone)]
pub struct FixedEmbedder {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
    delay: Option<Duration>,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
            delay: None,
        }
    }

    pub fn with(mut self, text: &str, vector: &[f32]) -> Self {
        self.vectors.insert(text.to_string(), vector.to_vec());
        self
    }

    /// Block for `delay` on every call, like a slow model.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Embedder for FixedEmbedder {
    fn model_id(&self) -> &str {
        "fixed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut vector = self.vectors.get(text).cloned().ok_or_else(|| {
            Error::BackendUnavailable(format!("no fixed vector for {text:?}"))
        })?;
        normalize(&mut vector);
        Ok(vector)
    }
}
