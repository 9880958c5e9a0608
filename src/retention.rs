//! Removing data of users who are gone or have gone quiet.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::{
    chunk_source::ChunkSource,
    document_db::{DocumentDb, now_secs},
    error::Result,
    manager::IndexCacheManager,
};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// What was deleted for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgedUser {
    pub user: String,
    pub documents: usize,
    pub chunks: usize,
    pub index_removed: bool,
}

/// Convert a `--older-than` day count into a duration.
pub fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(SECS_PER_DAY))
}

/// Delete every user whose newest document is older than `older_than`.
///
/// Rows go first so a crash midway leaves at worst an orphaned index,
/// which [`cleanup_orphans`] removes later.
pub async fn cleanup_inactive(
    db: &DocumentDb,
    manager: &IndexCacheManager,
    older_than: Duration,
) -> Result<Vec<PurgedUser>> {
    let cutoff = now_secs().saturating_sub(older_than.as_secs());
    let mut purged = Vec::new();

    for user in db.inactive_owners(cutoff)? {
        let (documents, chunks) = db.delete_owner(&user)?;
        let index_removed = manager.purge(&user).await?;
        info!(user = %user, documents, chunks, "removed inactive user");
        purged.push(PurgedUser {
            user,
            documents,
            chunks,
            index_removed,
        });
    }
    Ok(purged)
}

/// Delete persisted indexes of `persisted` users that have no stored chunks.
/// Returns the users whose artifacts were removed.
pub async fn cleanup_orphans(
    db: &DocumentDb,
    manager: &IndexCacheManager,
    persisted: Vec<String>,
) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for user in persisted {
        if db.list_chunk_ids(&user)?.is_empty() && manager.purge(&user).await? {
            removed.push(user);
        }
    }
    Ok(removed)
}
