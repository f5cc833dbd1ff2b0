use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::paths::PathError;
use super::pool::{HandlePool, PoolError};
use super::resolve::{Split, split_by_existence};
use super::tree::{FolderTree, NodeId, TreeError};
use crate::remote::{RemoteError, RemoteStore};

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("handle pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("folder id allocation failed: {0}")]
    Allocation(RemoteError),
    #[error("needed {needed} folder ids but got {got}")]
    ShortAllocation { needed: usize, got: usize },
    #[error("existing prefix {0:?} does not resolve")]
    UnresolvedPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFolder {
    pub node: NodeId,
    pub name: String,
    pub id: String,
    pub parent_id: String,
}

#[derive(Debug, Default)]
pub struct FolderMaterializer {
    pending: Vec<PendingFolder>,
}

impl FolderMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[PendingFolder] {
        &self.pending
    }

    pub fn take_pending(&mut self) -> Vec<PendingFolder> {
        std::mem::take(&mut self.pending)
    }

    pub async fn materialize<S: RemoteStore>(
        &mut self,
        tree: &mut FolderTree,
        path: &Path,
        pool: &HandlePool<S>,
    ) -> Result<NodeId, MaterializeError> {
        let split = split_by_existence(tree, path)?;
        let needed = split.missing_segments()?.len();
        if needed == 0 {
            return tree
                .lookup_id(&split.existing)
                .ok_or_else(|| MaterializeError::UnresolvedPrefix(path.display().to_string()));
        }

        let ids = {
            let handle = pool.acquire().await?;
            handle
                .allocate_ids(needed)
                .await
                .map_err(MaterializeError::Allocation)?
        };
        self.attach(tree, &split, ids)
    }

    pub fn attach(
        &mut self,
        tree: &mut FolderTree,
        split: &Split,
        ids: Vec<String>,
    ) -> Result<NodeId, MaterializeError> {
        let missing = split.missing_segments()?;
        if ids.len() < missing.len() {
            return Err(MaterializeError::ShortAllocation {
                needed: missing.len(),
                got: ids.len(),
            });
        }
        let mut current = tree.lookup_id(&split.existing).ok_or_else(|| {
            MaterializeError::UnresolvedPrefix(split.existing.display().to_string())
        })?;

        for (name, id) in missing.into_iter().zip(ids) {
            let parent_id = tree.node(current).remote_id.clone();
            current = tree.attach(current, name.to_string(), id.clone())?;
            debug!(
                folder = %tree.node(current).path().display(),
                %id,
                "attached pending folder"
            );
            self.pending.push(PendingFolder {
                node: current,
                name: name.to_string(),
                id,
                parent_id,
            });
        }
        Ok(current)
    }
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub durable: Vec<PendingFolder>,
    pub not_durable: Vec<(PendingFolder, String)>,
}

impl PushReport {
    pub fn is_durable(&self, folder_id: &str) -> bool {
        !self
            .not_durable
            .iter()
            .any(|(folder, _)| folder.id == folder_id)
    }
}

pub async fn push_pending<S: RemoteStore>(
    pending: Vec<PendingFolder>,
    pool: &HandlePool<S>,
) -> PushReport {
    let mut report = PushReport::default();
    let mut failed_ids: HashSet<String> = HashSet::new();

    for folder in pending {
        // Pending order puts parents first.
        if failed_ids.contains(&folder.parent_id) {
            failed_ids.insert(folder.id.clone());
            report
                .not_durable
                .push((folder, "parent folder was not created".to_string()));
            continue;
        }

        let result = match pool.acquire().await {
            Ok(handle) => handle
                .create_folder(&folder.name, &folder.id, &folder.parent_id)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match result {
            Ok(()) => {
                info!(folder = %folder.name, id = %folder.id, "created remote folder");
                report.durable.push(folder);
            }
            Err(reason) => {
                warn!(folder = %folder.name, id = %folder.id, %reason, "remote folder create failed");
                failed_ids.insert(folder.id.clone());
                report.not_durable.push((folder, reason));
            }
        }
    }
    report
}
