//! Text to vector encoders.
//!
//! Every embedder returns unit-length vectors so that inner product equals
//! cosine similarity downstream.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    model_manager::ModelManager,
};

/// Dimension of vectors produced by [`DegradedEmbedder`].
pub const DEGRADED_DIMENSION: usize = 384;

pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Encode `text` into a unit-normalized vector of length [`dimension`].
    ///
    /// [`dimension`]: Embedder::dimension
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// True when scores computed from this embedder's vectors carry no meaning.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Scale `vector` to unit L2 norm in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Mean-pooled ColBERT embeddings.
pub struct ModelEmbedder {
    model: Mutex<ModelManager>,
    model_id: String,
    dimension: usize,
}

impl ModelEmbedder {
    /// Load the model and measure its output dimension.
    pub fn load(model_id: &str) -> Result<Self> {
        let mut manager = ModelManager::with_model_id(model_id.to_string());
        let dimension = manager.encode_pooled("dimension check")?.len();
        if dimension == 0 {
            return Err(Error::BackendUnavailable(format!(
                "{model_id} produced empty embeddings"
            )));
        }

        Ok(Self {
            model: Mutex::new(manager),
            model_id: model_id.to_string(),
            dimension,
        })
    }
}

impl Embedder for ModelEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = {
            let mut model = self.model.lock().map_err(|_| {
                Error::BackendUnavailable("model lock poisoned".to_string())
            })?;
            model.encode_pooled(text)?
        };

        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

impl std::fmt::Debug for ModelEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEmbedder")
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

/// Stand-in used when no model can be loaded.
///
/// Produces uniform [0, 1) noise seeded by the text, so the same text always
/// maps to the same vector, but similarity between different texts is
/// meaningless.
#[derive(Debug, Clone)]
pub struct DegradedEmbedder {
    dimension: usize,
}

impl Default for DegradedEmbedder {
    fn default() -> Self {
        Self {
            dimension: DEGRADED_DIMENSION,
        }
    }
}

impl Embedder for DegradedEmbedder {
    fn model_id(&self) -> &str {
        "degraded"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(text.as_bytes());
        let mut bytes = vec![0u8; self.dimension * 4];
        hasher.finalize_xof().fill(&mut bytes);

        // Top 24 bits of each word give an exactly representable f32 in [0, 1).
        let mut vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|word| {
                let bits = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                (bits >> 8) as f32 / (1u32 << 24) as f32
            })
            .collect();

        normalize(&mut vector);
        Ok(vector)
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

/// Load `model_id`, falling back to [`DegradedEmbedder`] if it cannot be
/// loaded.
pub fn load_embedder(model_id: &str) -> Arc<dyn Embedder> {
    match ModelEmbedder::load(model_id) {
        Ok(embedder) => {
            info!(
                model = model_id,
                dimension = embedder.dimension(),
                "embedding model loaded"
            );
            Arc::new(embedder)
        }
        Err(e) => {
            warn!(
                model = model_id,
                error = %e,
                "embedding model unavailable, using degraded embedder"
            );
            Arc::new(DegradedEmbedder::default())
        }
    }
}

/// What a store can do with vectors, decided once when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackendStatus {
    /// A real model backs the index; vector ranking is trusted.
    Available,
    /// Vectors come from the degraded embedder and are only kept for shape.
    Degraded,
    /// No embedder and no index at all.
    Unavailable,
}

impl VectorBackendStatus {
    pub fn detect(embedder: Option<&dyn Embedder>) -> Self {
        match embedder {
            None => Self::Unavailable,
            Some(e) if e.is_degraded() => Self::Degraded,
            Some(_) => Self::Available,
        }
    }

    /// Whether the store keeps a vector index.
    pub fn has_index(self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    /// Whether search results may be ranked by vector similarity.
    pub fn trusts_vectors(self) -> bool {
        matches!(self, Self::Available)
    }
}

impl std::fmt::Display for VectorBackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Available => "available",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        })
    }
}
