use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    chunking::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, chunk_text},
    document_db::DocumentDb,
    error::{Error, Result},
    manager::IndexCacheManager,
    store::AddOutcome,
    text_util::{MAX_DOCUMENT_BYTES, clean_text, safe_truncate},
};

/// File extensions accepted by [`read_document`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md"];

/// Cleaned text of one document, ready to chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDocument {
    pub filename: String,
    pub text: String,
}

impl LoadedDocument {
    pub fn new(filename: &str, raw: &str) -> Self {
        let cleaned = clean_text(raw);
        Self {
            filename: filename.to_string(),
            text: safe_truncate(&cleaned, MAX_DOCUMENT_BYTES).to_string(),
        }
    }
}

/// Read a plain-text or markdown file. Invalid UTF-8 is replaced, then
/// the text is cleaned and capped at [`MAX_DOCUMENT_BYTES`].
pub fn read_document(path: &Path) -> Result<LoadedDocument> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(Error::Input(format!(
            "unsupported file type '{}' (expected one of: {})",
            path.display(),
            SUPPORTED_EXTENSIONS.join(", ")
        )));
    }

    let bytes = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());
    Ok(LoadedDocument::new(&filename, &String::from_utf8_lossy(&bytes)))
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub document_id: u64,
    pub filename: String,
    pub chunks_total: usize,
    /// Chunks embedded with the real model.
    pub indexed: usize,
    /// Chunks given a degraded vector.
    pub degraded: usize,
    /// Chunks stored without any vector.
    pub recorded: usize,
    pub failures: Vec<ChunkFailure>,
    pub cancelled: bool,
    pub flush_error: Option<String>,
}

impl IngestReport {
    pub fn processed(&self) -> usize {
        self.indexed + self.degraded + self.recorded + self.failures.len()
    }
}

/// Store `document` for `user_id` and add each of its chunks to the user's
/// index.
///
/// `cancel` is checked before every chunk; chunks already added stay added.
/// A chunk that fails is reported and skipped. The store is flushed at the
/// end and a flush failure is reported rather than returned.
/// `on_chunk` receives the number of chunks handled so far and the total.
pub async fn ingest_document(
    db: &DocumentDb,
    manager: &IndexCacheManager,
    user_id: &str,
    document: &LoadedDocument,
    cancel: &AtomicBool,
    mut on_chunk: impl FnMut(usize, usize),
) -> Result<IngestReport> {
    let chunks = chunk_text(&document.text, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
    if chunks.is_empty() {
        return Err(Error::Input(format!(
            "'{}' contains no text",
            document.filename
        )));
    }

    let document_id = db.insert_document(user_id, &document.filename)?;
    let mut report = IngestReport {
        document_id,
        filename: document.filename.clone(),
        chunks_total: chunks.len(),
        ..Default::default()
    };

    let mut store = manager.get_store(user_id).await;
    for chunk in &chunks {
        if cancel.load(Ordering::Relaxed) {
            info!(
                user = user_id,
                done = report.processed(),
                total = report.chunks_total,
                "ingestion cancelled"
            );
            report.cancelled = true;
            break;
        }

        let added = match db.insert_chunk(user_id, document_id, chunk.index as u32, &chunk.text) {
            Ok(chunk_id) => match store.add_chunk(chunk_id, &chunk.text).await {
                // Pushed out of the cache mid-ingestion; continue on the
                // store that replaced it.
                Err(Error::Evicted(_)) => {
                    store = manager.get_store(user_id).await;
                    store.add_chunk(chunk_id, &chunk.text).await
                }
                other => other,
            },
            Err(e) => Err(e),
        };

        match added {
            Ok(AddOutcome::Indexed(_)) => report.indexed += 1,
            Ok(AddOutcome::Degraded(_)) => report.degraded += 1,
            Ok(AddOutcome::Recorded) => report.recorded += 1,
            Err(e) => {
                warn!(
                    user = user_id,
                    chunk_index = chunk.index,
                    error = %e,
                    "skipping chunk"
                );
                report.failures.push(ChunkFailure {
                    chunk_index: chunk.index,
                    error: e.to_string(),
                });
            }
        }
        on_chunk(report.processed(), report.chunks_total);
    }

    if let Err(e) = store.flush().await {
        warn!(user = user_id, error = %e, "flush after ingestion failed");
        report.flush_error = Some(e.to_string());
    }

    Ok(report)
}
