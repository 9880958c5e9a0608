use std::{
    collections::BTreeMap,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::{
    chunk_source::{ChunkId, ChunkSource},
    error::Result,
};

const DOCUMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("documents");
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const NEXT_DOCUMENT_ID: &str = "next_document_id";
const NEXT_CHUNK_ID: &str = "next_chunk_id";

/// A stored document header. The text itself lives in its chunks.
///
/// Rows are stored as JSON so owners and filenames may hold any character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub owner: String,
    pub filename: String,
    pub created_at: u64,
}

impl DocumentRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// A chunk row, stored as JSON like [`DocumentRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub owner: String,
    pub document_id: u64,
    pub chunk_index: u32,
    pub text: String,
}

impl ChunkRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Per-owner row counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnerSummary {
    pub owner: String,
    pub documents: usize,
    pub chunks: usize,
}

/// Relational side of the service: documents, their chunks and settings.
pub struct DocumentDb {
    db: Database,
}

impl DocumentDb {
    /// Open or create the document database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use docchat::DocumentDb;
    ///
    /// let db = DocumentDb::open(&tmp.path().join("documents.redb")).unwrap();
    /// assert!(db.owner_summaries().unwrap().is_empty());
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(CHUNKS)?;
        txn.open_table(SETTINGS)?;
        txn.open_table(COUNTERS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Documents --

    pub fn insert_document(&self, owner: &str, filename: &str) -> Result<u64> {
        self.insert_document_at(owner, filename, now_secs())
    }

    /// Store a document header with an explicit creation time in Unix
    /// seconds.
    pub fn insert_document_at(
        &self,
        owner: &str,
        filename: &str,
        created_at: u64,
    ) -> Result<u64> {
        let record = DocumentRecord {
            owner: owner.to_string(),
            filename: filename.to_string(),
            created_at,
        };
        let bytes = record.to_bytes()?;

        let txn = self.db.begin_write()?;
        let id = allocate_id(&txn, NEXT_DOCUMENT_ID)?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert(id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(id)
    }

    pub fn get_document(&self, id: u64) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table
            .get(id)?
            .and_then(|v| DocumentRecord::from_bytes(v.value())))
    }

    pub fn list_documents(
        &self,
        owner: &str,
    ) -> Result<Vec<(u64, DocumentRecord)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if let Some(record) = DocumentRecord::from_bytes(v.value())
                && record.owner == owner
            {
                result.push((k.value(), record));
            }
        }
        Ok(result)
    }

    // -- Chunks --

    /// Store one chunk and return its newly allocated, globally unique id.
    pub fn insert_chunk(
        &self,
        owner: &str,
        document_id: u64,
        chunk_index: u32,
        text: &str,
    ) -> Result<ChunkId> {
        let record = ChunkRecord {
            owner: owner.to_string(),
            document_id,
            chunk_index,
            text: text.to_string(),
        };
        let bytes = record.to_bytes()?;

        let txn = self.db.begin_write()?;
        let id = allocate_id(&txn, NEXT_CHUNK_ID)?;
        {
            let mut table = txn.open_table(CHUNKS)?;
            table.insert(id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(id)
    }

    pub fn get_chunk(&self, id: ChunkId) -> Result<Option<ChunkRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHUNKS)?;
        Ok(table
            .get(id)?
            .and_then(|v| ChunkRecord::from_bytes(v.value())))
    }

    // -- Owners --

    /// Document and chunk counts for every owner, sorted by owner.
    pub fn owner_summaries(&self) -> Result<Vec<OwnerSummary>> {
        let txn = self.db.begin_read()?;
        let mut summaries: BTreeMap<String, OwnerSummary> = BTreeMap::new();

        let documents = txn.open_table(DOCUMENTS)?;
        for entry in documents.iter()? {
            let (_, v) = entry?;
            if let Some(record) = DocumentRecord::from_bytes(v.value()) {
                summaries
                    .entry(record.owner.clone())
                    .or_insert_with(|| OwnerSummary {
                        owner: record.owner,
                        ..Default::default()
                    })
                    .documents += 1;
            }
        }

        let chunks = txn.open_table(CHUNKS)?;
        for entry in chunks.iter()? {
            let (_, v) = entry?;
            if let Some(record) = ChunkRecord::from_bytes(v.value()) {
                summaries
                    .entry(record.owner.clone())
                    .or_insert_with(|| OwnerSummary {
                        owner: record.owner,
                        ..Default::default()
                    })
                    .chunks += 1;
            }
        }

        Ok(summaries.into_values().collect())
    }

    /// Delete every document and chunk row of `owner` in a single transaction.
    ///
    /// Returns `(documents_removed, chunks_removed)`.
    pub fn delete_owner(&self, owner: &str) -> Result<(usize, usize)> {
        let txn = self.db.begin_write()?;
        let removed_documents = remove_owned(&txn, DOCUMENTS, |bytes| {
            DocumentRecord::from_bytes(bytes).is_some_and(|r| r.owner == owner)
        })?;
        let removed_chunks = remove_owned(&txn, CHUNKS, |bytes| {
            ChunkRecord::from_bytes(bytes).is_some_and(|r| r.owner == owner)
        })?;
        txn.commit()?;
        Ok((removed_documents, removed_chunks))
    }

    /// Owners whose newest document was created before `cutoff` (Unix
    /// seconds), sorted by owner.
    pub fn inactive_owners(&self, cutoff: u64) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut newest: BTreeMap<String, u64> = BTreeMap::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            if let Some(record) = DocumentRecord::from_bytes(v.value()) {
                let latest = newest.entry(record.owner).or_insert(0);
                *latest = (*latest).max(record.created_at);
            }
        }
        Ok(newest
            .into_iter()
            .filter(|(_, latest)| *latest < cutoff)
            .map(|(owner, _)| owner)
            .collect())
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }
}

impl ChunkSource for DocumentDb {
    fn chunk_text(&self, owner: &str, chunk_id: ChunkId) -> Result<Option<String>> {
        Ok(self
            .get_chunk(chunk_id)?
            .filter(|record| record.owner == owner)
            .map(|record| record.text))
    }

    fn list_chunk_ids(&self, owner: &str) -> Result<Vec<ChunkId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHUNKS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if ChunkRecord::from_bytes(v.value())
                .is_some_and(|record| record.owner == owner)
            {
                result.push(k.value());
            }
        }
        Ok(result)
    }
}

impl std::fmt::Debug for DocumentDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDb").finish_non_exhaustive()
    }
}

fn allocate_id(txn: &WriteTransaction, key: &str) -> Result<u64> {
    let mut counters = txn.open_table(COUNTERS)?;
    let next = counters.get(key)?.map(|v| v.value()).unwrap_or(1);
    counters.insert(key, next + 1)?;
    Ok(next)
}

fn remove_owned(
    txn: &WriteTransaction,
    definition: TableDefinition<u64, &[u8]>,
    is_owned: impl Fn(&[u8]) -> bool,
) -> Result<usize> {
    let mut table = txn.open_table(definition)?;
    let mut doomed = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        if is_owned(v.value()) {
            doomed.push(k.value());
        }
    }
    for id in &doomed {
        table.remove(*id)?;
    }
    Ok(doomed.len())
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, DocumentDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = DocumentDb::open(&tmp.path().join("documents.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn chunk_ids_are_globally_unique_and_increasing() {
        let (_tmp, db) = test_db();

        let doc_a = db.insert_document("alice", "a.txt").unwrap();
        let doc_b = db.insert_document("bob", "b.txt").unwrap();
        assert_ne!(doc_a, doc_b);

        let c1 = db.insert_chunk("alice", doc_a, 0, "one").unwrap();
        let c2 = db.insert_chunk("bob", doc_b, 0, "two").unwrap();
        let c3 = db.insert_chunk("alice", doc_a, 1, "three").unwrap();
        assert!(c1 < c2 && c2 < c3);
    }

    #[test]
    fn chunk_text_is_filtered_by_owner() {
        let (_tmp, db) = test_db();
        let doc = db.insert_document("alice", "a.txt").unwrap();
        let id = db.insert_chunk("alice", doc, 0, "secret").unwrap();

        assert_eq!(
            db.chunk_text("alice", id).unwrap(),
            Some("secret".to_string())
        );
        assert_eq!(db.chunk_text("mallory", id).unwrap(), None);
        assert_eq!(db.chunk_text("alice", 9999).unwrap(), None);
    }

    #[test]
    fn list_chunk_ids_in_ingestion_order() {
        let (_tmp, db) = test_db();
        let doc = db.insert_document("alice", "a.txt").unwrap();
        let other = db.insert_document("bob", "b.txt").unwrap();

        let first = db.insert_chunk("alice", doc, 0, "a").unwrap();
        db.insert_chunk("bob", other, 0, "b").unwrap();
        let second = db.insert_chunk("alice", doc, 1, "c").unwrap();

        assert_eq!(db.list_chunk_ids("alice").unwrap(), vec![first, second]);
    }

    #[test]
    fn chunk_text_may_contain_separators() {
        let (_tmp, db) = test_db();
        let doc = db.insert_document("alice", "a.txt").unwrap();
        let id = db.insert_chunk("alice", doc, 0, "a\0b").unwrap();

        let record = db.get_chunk(id).unwrap().unwrap();
        assert_eq!(record.text, "a\0b");
        assert_eq!(record.document_id, doc);
    }

    #[test]
    fn delete_owner_removes_only_that_owner() {
        let (_tmp, db) = test_db();
        let doc_a = db.insert_document("alice", "a.txt").unwrap();
        let doc_b = db.insert_document("bob", "b.txt").unwrap();
        db.insert_chunk("alice", doc_a, 0, "a").unwrap();
        db.insert_chunk("alice", doc_a, 1, "b").unwrap();
        let kept = db.insert_chunk("bob", doc_b, 0, "c").unwrap();

        assert_eq!(db.delete_owner("alice").unwrap(), (1, 2));
        assert!(db.list_chunk_ids("alice").unwrap().is_empty());
        assert_eq!(db.list_chunk_ids("bob").unwrap(), vec![kept]);
        assert!(db.get_document(doc_a).unwrap().is_none());
    }

    #[test]
    fn owner_summaries_count_rows() {
        let (_tmp, db) = test_db();
        let doc = db.insert_document("alice", "a.txt").unwrap();
        db.insert_chunk("alice", doc, 0, "a").unwrap();
        db.insert_chunk("alice", doc, 1, "b").unwrap();
        db.insert_document("bob", "b.txt").unwrap();

        let summaries = db.owner_summaries().unwrap();
        assert_eq!(
            summaries,
            vec![
                OwnerSummary {
                    owner: "alice".to_string(),
                    documents: 1,
                    chunks: 2,
                },
                OwnerSummary {
                    owner: "bob".to_string(),
                    documents: 1,
                    chunks: 0,
                },
            ]
        );
    }

    #[test]
    fn settings_crud() {
        let (_tmp, db) = test_db();

        assert_eq!(db.get_setting("max_services").unwrap(), None);
        assert_eq!(db.get_setting_or("max_services", "32").unwrap(), "32");

        db.set_setting("max_services", "4").unwrap();
        assert_eq!(db.get_setting_or("max_services", "32").unwrap(), "4");
    }

    #[test]
    fn reopen_preserves_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("documents.redb");

        let first = {
            let db = DocumentDb::open(&path).unwrap();
            let doc = db.insert_document("alice", "a.txt").unwrap();
            db.insert_chunk("alice", doc, 0, "a").unwrap()
        };

        let db = DocumentDb::open(&path).unwrap();
        let doc = db.insert_document("alice", "b.txt").unwrap();
        let second = db.insert_chunk("alice", doc, 0, "b").unwrap();
        assert!(second > first);
    }

    #[test]
    fn record_round_trip() {
        let meta = DocumentRecord {
            owner: "alice".to_string(),
            filename: "notes.txt".to_string(),
            created_at: 1_700_000_000,
        };
        let bytes = meta.to_bytes().unwrap();
        assert_eq!(DocumentRecord::from_bytes(&bytes), Some(meta));
        assert!(DocumentRecord::from_bytes(b"garbage").is_none());
    }

    #[test]
    fn nul_bytes_in_owner_and_filename_survive() {
        let (_tmp, db) = test_db();
        let owner = "ali\0ce";
        let doc = db.insert_document(owner, "a\0b.txt").unwrap();
        let chunk = db.insert_chunk(owner, doc, 0, "text\0with nul").unwrap();
        db.insert_document("ali", "ce").unwrap();

        let docs = db.list_documents(owner).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].1.filename, "a\0b.txt");
        assert_eq!(
            db.chunk_text(owner, chunk).unwrap().as_deref(),
            Some("text\0with nul")
        );
        assert_eq!(db.chunk_text("ali", chunk).unwrap(), None);
        assert_eq!(db.list_chunk_ids(owner).unwrap(), vec![chunk]);

        assert_eq!(db.delete_owner(owner).unwrap(), (1, 1));
        assert_eq!(db.list_documents("ali").unwrap().len(), 1);
    }

    #[test]
    fn inactive_owners_use_newest_document() {
        let (_tmp, db) = test_db();
        db.insert_document_at("alice", "old.txt", 100).unwrap();
        db.insert_document_at("alice", "new.txt", 900).unwrap();
        db.insert_document_at("bob", "old.txt", 200).unwrap();
        db.insert_document_at("carol", "edge.txt", 500).unwrap();

        assert_eq!(
            db.inactive_owners(500).unwrap(),
            vec!["bob".to_string()]
        );
        assert_eq!(
            db.inactive_owners(1_000).unwrap(),
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]
        );
    }
}
