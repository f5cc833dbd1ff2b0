use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use super::tree::{FolderRecord, FolderTree, TreeError};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum TreeCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot format version {found} is not supported")]
    VersionMismatch { found: u32 },
    #[error("snapshot does not form a tree: {0}")]
    Tree(#[from] TreeError),
    #[error("failed to format timestamp: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    generated_at: String,
    folders: Vec<FolderRecord>,
}

pub async fn load(path: &Path) -> Result<Option<FolderTree>, TreeCacheError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let snapshot: Snapshot = serde_json::from_slice(&raw)?;
    if snapshot.version != FORMAT_VERSION {
        return Err(TreeCacheError::VersionMismatch {
            found: snapshot.version,
        });
    }
    debug!(
        path = %path.display(),
        generated_at = %snapshot.generated_at,
        folders = snapshot.folders.len(),
        "loaded folder tree snapshot"
    );
    Ok(Some(FolderTree::build(snapshot.folders)?))
}

pub async fn save(path: &Path, tree: &FolderTree) -> Result<(), TreeCacheError> {
    let snapshot = Snapshot {
        version: FORMAT_VERSION,
        generated_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
        folders: tree.records(),
    };
    let body = serde_json::to_vec_pretty(&snapshot)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
