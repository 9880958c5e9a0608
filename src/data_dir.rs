use std::path::{Path, PathBuf};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "DOCCHAT_DATA_DIR";

/// Characters escaped when a user id becomes a file stem.
const USER_STEM: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

const VECTORS_EXT: &str = "vectors";
const CHUNK_IDS_SUFFIX: &str = ".chunks.json";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The DOCCHAT_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/docchat/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("docchat")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn documents_db(&self) -> PathBuf {
        self.root.join("documents.redb")
    }

    pub fn indexes_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("indexes");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    /// Users that have at least one persisted artifact under `indexes/`.
    pub fn persisted_users(&self) -> Result<Vec<String>> {
        let dir = self.indexes_dir()?;
        let mut users = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let stem = name
                .strip_suffix(CHUNK_IDS_SUFFIX)
                .or_else(|| name.strip_suffix(&format!(".{VECTORS_EXT}")));
            if let Some(user) = stem.and_then(decode_user_stem)
                && !users.contains(&user)
            {
                users.push(user);
            }
        }
        users.sort();
        Ok(users)
    }
}

/// The pair of files that make up one user's persisted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArtifacts {
    /// Serialized vector index blob.
    pub vectors: PathBuf,
    /// JSON array of every chunk id recorded for the user, in ingestion order.
    pub chunk_ids: PathBuf,
}

impl IndexArtifacts {
    pub fn for_user(indexes_dir: &Path, user_id: &str) -> Self {
        let stem = user_stem(user_id);
        Self {
            vectors: indexes_dir.join(format!("{stem}.{VECTORS_EXT}")),
            chunk_ids: indexes_dir.join(format!("{stem}{CHUNK_IDS_SUFFIX}")),
        }
    }

    pub fn exists(&self) -> bool {
        self.vectors.exists() || self.chunk_ids.exists()
    }
}

/// Encode a user id into a file stem that is safe on every platform.
pub fn user_stem(user_id: &str) -> String {
    utf8_percent_encode(user_id, USER_STEM).to_string()
}

pub fn decode_user_stem(stem: &str) -> Option<String> {
    percent_decode_str(stem)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}
