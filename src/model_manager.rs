use std::fmt::Display;

use candle_core::Device;
use pylate_rs::ColBERT;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "DOCCHAT_MODEL";

/// The model id from `DOCCHAT_MODEL`, or the default ColBERT model.
pub fn default_model_id() -> String {
    std::env::var(MODEL_ENV_VAR).unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string())
}

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn backend_error(context: &str, err: impl Display) -> Error {
    Error::BackendUnavailable(format!("{context}: {err}"))
}

/// Owns the ColBERT weights, loading them on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl ModelManager {
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: None,
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if let Some(model) = self.model.as_mut() {
            return Ok(model);
        }

        let loaded: std::result::Result<ColBERT, _> =
            ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into();
        let colbert = loaded.map_err(|e| {
            backend_error(&format!("failed to load {}", self.model_id), e)
        })?;

        Ok(self.model.insert(colbert))
    }

    /// Encode one text into a single vector by mean-pooling its token
    /// embeddings. The result is not normalized.
    pub fn encode_pooled(&mut self, text: &str) -> Result<Vec<f32>> {
        let model = self.ensure_loaded()?;
        let embeddings = model
            .encode(&[text.to_string()], false)
            .map_err(|e| backend_error("encoding failed", e))?;

        // [1, T, D] -> [T, D] -> [D]
        embeddings
            .squeeze(0)
            .and_then(|tokens| tokens.mean(0))
            .and_then(|pooled| pooled.to_vec1::<f32>())
            .map_err(|e| backend_error("pooling failed", e))
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("model_id", &self.model_id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
