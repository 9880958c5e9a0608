//! Crash-safe file replacement for persisted index artifacts.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hidden sibling of `path` used as the staging file for one write.
fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(".{name}.tmp-{}-{n}", std::process::id());
    path.parent()
        .unwrap_or(Path::new("."))
        .join(tmp_name)
}

/// Replace `path` with `data` so readers see either the old or the new
/// contents, never a partial file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);

    let staged = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(source) = staged {
        tokio::fs::remove_file(&tmp).await.ok();
        return Err(Error::Persistence {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Read `path`, treating a missing file as `None`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::Persistence {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Delete `path` if present. Returns whether a file was removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(Error::Persistence {
            path: path.to_path_buf(),
            source,
        }),
    }
}
