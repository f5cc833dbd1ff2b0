//! One end-to-end conversion run.
//!
//! Raw `.ibt` files are listed per driver, downloaded, converted locally and
//! the resulting CSV files uploaded into a per-driver remote folder. A source
//! file is recorded in the ledger only once its CSV is uploaded, so a file that
//! fails anywhere along the way is retried on the next run.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{StreamExt, stream};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::convert::Converter;
use crate::remote::{RemoteError, RemoteStore};
use crate::sync::ledger::{DedupLedger, LedgerError, Persisted};
use crate::sync::materialize::{FolderMaterializer, PushReport, push_pending};
use crate::sync::paths::{PathError, local_path_for};
use crate::sync::pool::{HandlePool, PoolError};
use crate::sync::transfer::{TransferItem, TransferOrchestrator};
use crate::sync::tree::{FolderTree, TreeError};
use crate::sync::tree_cache;

const SOURCE_EXTENSION: &str = ".ibt";
const CSV_MIME_TYPE: &str = "text/csv";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("folder listing failed: {0}")]
    Listing(#[from] RemoteError),
    #[error("remote folders do not form a tree: {0}")]
    Tree(#[from] TreeError),
    #[error("handle pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("remote folder {0:?} does not exist")]
    MissingFolder(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub source_id: String,
    pub name: String,
    pub reason: String,
}

/// Final partition of the run's source files.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Source file names whose CSV was uploaded.
    pub succeeded: Vec<String>,
    pub failed: Vec<ItemFailure>,
    /// Source file names already in the ledger.
    pub skipped: Vec<String>,
    /// Drivers whose destination folder could not be prepared.
    pub skipped_drivers: Vec<String>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped_drivers.is_empty()
    }

    fn fail(&mut self, source: &Source, source_id: &str, reason: impl Into<String>) {
        self.failed.push(ItemFailure {
            source_id: source_id.to_string(),
            name: source.name.clone(),
            reason: reason.into(),
        });
    }
}

#[derive(Debug, Clone)]
struct Source {
    driver: String,
    name: String,
}

pub struct Pipeline<S> {
    config: RunConfig,
    pool: Arc<HandlePool<S>>,
    converter: Converter,
    rebuild_tree: bool,
}

impl<S: RemoteStore + 'static> Pipeline<S> {
    pub fn new(config: RunConfig, pool: Arc<HandlePool<S>>) -> Self {
        let converter = Converter::new(config.converter.clone())
            .with_launcher(config.converter_launcher.clone());
        Self {
            config,
            pool,
            converter,
            rebuild_tree: false,
        }
    }

    /// Ignore the tree snapshot and list folders from the remote.
    pub fn with_rebuild_tree(mut self, rebuild: bool) -> Self {
        self.rebuild_tree = rebuild;
        self
    }

    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let ledger = DedupLedger::load(&self.config.ledger).await?;
        let mut tree = self.load_tree().await?;
        let ibt_folder_id = tree
            .lookup(&self.config.ibt_folder)
            .map(|node| node.remote_id.clone())
            .ok_or_else(|| PipelineError::MissingFolder(self.config.ibt_folder.clone()))?;

        let mut summary = RunSummary::default();
        let mut materializer = FolderMaterializer::new();
        let mut destinations = Vec::new();
        for driver in &self.config.drivers {
            let folder = self.config.csv_folder(driver);
            match materializer.materialize(&mut tree, &folder, &self.pool).await {
                Ok(node) => destinations.push((driver.clone(), tree.node(node).remote_id.clone())),
                Err(err) => {
                    warn!(%driver, folder = %folder.display(), %err, "skipping driver for this run");
                    summary.skipped_drivers.push(driver.clone());
                }
            }
        }

        let pending = materializer.take_pending();
        let push = {
            let pool = Arc::clone(&self.pool);
            let pending = pending.clone();
            tokio::spawn(async move { push_pending(pending, &pool).await })
        };

        let mut sources = HashMap::new();
        let mut downloads = Vec::new();
        for (driver, destination) in &destinations {
            let files = {
                let handle = self.pool.acquire().await?;
                handle
                    .list_files(&ibt_folder_id, &[SOURCE_EXTENSION, driver.as_str()])
                    .await
            };
            let files = match files {
                Ok(files) => files,
                Err(err) => {
                    warn!(%driver, %err, "listing source files failed, skipping driver");
                    summary.skipped_drivers.push(driver.clone());
                    continue;
                }
            };
            for file in files {
                if sources.contains_key(&file.id) {
                    continue;
                }
                let source = Source {
                    driver: driver.clone(),
                    name: file.name.clone(),
                };
                if ledger.contains(&file.id) {
                    debug!(item = %file.name, "already converted");
                    summary.skipped.push(file.name);
                    sources.insert(file.id, source);
                    continue;
                }
                match artifact_path(&self.config.local_ibt_dir(driver), &file.id, &file.name) {
                    Ok(local_path) => downloads.push(TransferItem {
                        source_id: file.id.clone(),
                        name: file.name,
                        expected_digest: file.sha256,
                        size_bytes: file.size,
                        local_path,
                        destination_folder_id: destination.clone(),
                        mime_type: CSV_MIME_TYPE.to_string(),
                        uploaded_id: None,
                    }),
                    Err(err) => summary.fail(&source, &file.id, err.to_string()),
                }
                sources.insert(file.id, source);
            }
        }
        info!(
            queued = downloads.len(),
            skipped = summary.skipped.len(),
            "source files listed"
        );

        let mut artifacts: Vec<PathBuf> = downloads.iter().map(|i| i.local_path.clone()).collect();
        let orchestrator = TransferOrchestrator::new(Arc::clone(&self.pool), self.config.transfer);
        let downloaded = orchestrator.download_batch(downloads).await;
        for failed in downloaded.failed {
            if let Some(source) = sources.get(&failed.item.source_id) {
                summary.fail(source, &failed.item.source_id, failed.error.to_string());
            }
        }

        let converted: Vec<_> = stream::iter(downloaded.succeeded)
            .map(|done| self.convert(done.item, &sources))
            .buffer_unordered(self.config.transfer.workers.max(1))
            .collect()
            .await;

        let push_report = match push.await {
            Ok(report) => report,
            Err(err) => {
                error!(%err, "folder push task failed");
                PushReport {
                    durable: Vec::new(),
                    not_durable: pending
                        .into_iter()
                        .map(|folder| (folder, err.to_string()))
                        .collect(),
                }
            }
        };

        let mut uploads = Vec::new();
        for outcome in converted {
            match outcome {
                Ok(item) => {
                    artifacts.push(item.local_path.clone());
                    if push_report.is_durable(&item.destination_folder_id) {
                        uploads.push(item);
                    } else if let Some(source) = sources.get(&item.source_id) {
                        summary.fail(source, &item.source_id, "destination folder was not created");
                    }
                }
                Err((item, output, reason)) => {
                    if let Some(output) = output {
                        artifacts.push(output);
                    }
                    if let Some(source) = sources.get(&item.source_id) {
                        summary.fail(source, &item.source_id, reason);
                    }
                }
            }
        }

        let uploaded = orchestrator.upload_batch(uploads).await;
        for item in uploaded.succeeded {
            ledger.add(item.source_id.clone());
            if let Some(source) = sources.get(&item.source_id) {
                summary.succeeded.push(source.name.clone());
            }
        }
        for failed in uploaded.failed {
            if let Some(source) = sources.get(&failed.item.source_id) {
                summary.fail(source, &failed.item.source_id, failed.error.to_string());
            }
        }

        match ledger.persist().await? {
            Persisted::Written(entries) => info!(entries, "ledger saved"),
            Persisted::Skipped => debug!("ledger write-back disabled"),
        }
        self.save_tree(&tree, &push_report).await;
        if !self.config.keep_local {
            remove_artifacts(&artifacts).await;
        }

        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            skipped_drivers = summary.skipped_drivers.len(),
            "run finished"
        );
        Ok(summary)
    }

    async fn load_tree(&self) -> Result<FolderTree, PipelineError> {
        let cache = &self.config.tree_cache;
        if cache.enabled && !self.rebuild_tree {
            match tree_cache::load(&cache.path).await {
                Ok(Some(tree)) => {
                    info!(folders = tree.len(), "using folder tree snapshot");
                    return Ok(tree);
                }
                Ok(None) => debug!(path = %cache.path.display(), "no folder tree snapshot"),
                Err(err) => warn!(%err, "discarding folder tree snapshot"),
            }
        }
        let records = {
            let handle = self.pool.acquire().await?;
            handle.list_folders().await?
        };
        let tree = FolderTree::build(records)?;
        info!(folders = tree.len(), "folder tree built from listing");
        Ok(tree)
    }

    /// Snapshots the tree unless it holds folders the remote never created.
    async fn save_tree(&self, tree: &FolderTree, push: &PushReport) {
        let cache = &self.config.tree_cache;
        if !cache.enabled {
            return;
        }
        if !push.not_durable.is_empty() {
            warn!(
                folders = push.not_durable.len(),
                "not saving folder tree snapshot with uncreated folders"
            );
            return;
        }
        if let Err(err) = tree_cache::save(&cache.path, tree).await {
            warn!(path = %cache.path.display(), %err, "failed to save folder tree snapshot");
        }
    }

    /// Converts a downloaded source into its CSV upload item.
    ///
    /// On failure the output path is returned too, when known, so a partial
    /// CSV can be cleaned up.
    async fn convert(
        &self,
        item: TransferItem,
        sources: &HashMap<String, Source>,
    ) -> Result<TransferItem, (TransferItem, Option<PathBuf>, String)> {
        let Some(source) = sources.get(&item.source_id) else {
            return Err((item, None, "unknown source".to_string()));
        };
        let csv_name = csv_name_for(&item.name);
        let csv_dir = self.config.local_csv_dir(&source.driver);
        let output = match artifact_path(&csv_dir, &item.source_id, &csv_name) {
            Ok(output) => output,
            Err(err) => return Err((item, None, err.to_string())),
        };
        if let Err(err) = self
            .converter
            .run(&item.local_path, &output, &self.config.vars)
            .await
        {
            warn!(item = %item.name, %err, "conversion failed");
            return Err((item, Some(output), err.to_string()));
        }
        info!(item = %item.name, csv = %output.display(), "converted");
        Ok(TransferItem {
            name: csv_name,
            expected_digest: None,
            size_bytes: 0,
            local_path: output,
            ..item
        })
    }
}

/// Local files live under one directory per source id, since remote names
/// are not unique within a folder.
fn artifact_path(base: &Path, source_id: &str, name: &str) -> Result<PathBuf, PathError> {
    local_path_for(&local_path_for(base, source_id)?, name)
}

fn csv_name_for(source_name: &str) -> String {
    Path::new(source_name)
        .with_extension("csv")
        .to_string_lossy()
        .into_owned()
}

async fn remove_artifacts(paths: &[PathBuf]) {
    let mut seen = HashSet::new();
    for path in paths.iter().filter(|p| seen.insert(p.as_path())) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed local artifact"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), %err, "failed to remove local artifact"),
        }
        // Only succeeds once the per-source directory is empty.
        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
