//! docchat - per-user retrieval indexes for chatting with your documents.
//!
//! Every user owns a private vector index over the chunks of their uploaded
//! documents. Indexes are loaded lazily from disk, kept in a bounded LRU
//! cache and flushed back when they are evicted. When no embedding model is
//! available, retrieval falls back to keyword overlap over the user's most
//! recent chunks.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! use docchat::{
//!     DataDir,
//!     DocumentDb,
//!     IndexCacheManager,
//!     ServiceConfig,
//!     config::ConfigOverrides,
//!     ingestion::{LoadedDocument, ingest_document},
//! };
//!
//! # async fn run() -> docchat::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let db = Arc::new(DocumentDb::open(&data_dir.documents_db())?);
//! let config = ServiceConfig::resolve(&ConfigOverrides::default(), &db)?;
//! let manager = IndexCacheManager::open(&data_dir, &config, db.clone())?;
//!
//! let document = LoadedDocument::new("notes.md", "Basil grows well next to tomatoes.");
//! let cancel = AtomicBool::new(false);
//! ingest_document(&db, &manager, "alice", &document, &cancel, |_, _| {}).await?;
//!
//! let store = manager.get_store("alice").await;
//! for hit in store.search_similar("basil", 5).await {
//!     println!("#{} {:.3} {}", hit.chunk_id, hit.score, hit.text);
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod chunk_source;
pub mod chunking;
pub mod config;
pub mod data_dir;
pub mod document_db;
pub mod embedding;
pub mod error;
pub mod ingestion;
pub mod lexical;
pub mod manager;
pub mod mcp;
pub mod model_manager;
pub mod persist;
pub mod retention;
pub mod store;
pub mod text_util;
pub mod vector_index;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk_source::{ChunkId, ChunkSource};
pub use config::ServiceConfig;
pub use data_dir::DataDir;
pub use document_db::DocumentDb;
pub use embedding::{Embedder, VectorBackendStatus};
pub use error::{Error, Result};
pub use manager::IndexCacheManager;
pub use model_manager::ModelManager;
pub use store::UserIndexStore;
pub use vector_index::VectorIndex;
