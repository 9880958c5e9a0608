use crate::error::Result;

/// Globally unique chunk identifier assigned by the document store.
pub type ChunkId = u64;

/// Read access to chunk text owned by a user.
///
/// Lookups are always filtered by owner: a chunk that exists but belongs to
/// someone else is reported as missing.
pub trait ChunkSource: Send + Sync {
    fn chunk_text(&self, owner: &str, chunk_id: ChunkId) -> Result<Option<String>>;

    /// All chunk ids owned by `owner`, in ascending (ingestion) order.
    fn list_chunk_ids(&self, owner: &str) -> Result<Vec<ChunkId>>;
}
