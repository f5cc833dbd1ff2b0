use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use futures_util::{StreamExt, stream};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::integrity::ContentHasher;
use super::pool::{HandlePool, PoolError};
use crate::remote::{RemoteError, RemoteStore};

pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{size} bytes exceeds the {limit} byte transfer limit")]
    SizeExceeded { size: u64, limit: u64 },
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("handle pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("transfer task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub source_id: String,
    pub name: String,
    pub expected_digest: Option<String>,
    pub size_bytes: u64,
    pub local_path: PathBuf,
    pub destination_folder_id: String,
    pub mime_type: String,
    pub uploaded_id: Option<String>,
}

#[derive(Debug)]
pub struct Downloaded {
    pub item: TransferItem,
    pub digest: String,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct FailedItem {
    pub item: TransferItem,
    pub error: TransferError,
}

#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<FailedItem>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub workers: usize,
    pub max_transfer_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
        }
    }
}

pub struct TransferOrchestrator<S> {
    pool: Arc<HandlePool<S>>,
    config: TransferConfig,
}

impl<S: RemoteStore + 'static> TransferOrchestrator<S> {
    pub fn new(pool: Arc<HandlePool<S>>, config: TransferConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &Arc<HandlePool<S>> {
        &self.pool
    }

    pub async fn download_batch(&self, items: Vec<TransferItem>) -> BatchReport<Downloaded> {
        let limit = self.config.max_transfer_bytes;
        self.run_batch("download", items, move |pool, item| async move {
            match download_one(&pool, &item, limit).await {
                Ok((digest, bytes)) => Ok(Downloaded {
                    item,
                    digest,
                    bytes,
                }),
                Err(error) => Err(FailedItem { item, error }),
            }
        })
        .await
    }

    pub async fn upload_batch(&self, items: Vec<TransferItem>) -> BatchReport<TransferItem> {
        self.run_batch("upload", items, |pool, mut item| async move {
            match upload_one(&pool, &item).await {
                Ok(id) => {
                    item.uploaded_id = Some(id);
                    Ok(item)
                }
                Err(error) => Err(FailedItem { item, error }),
            }
        })
        .await
    }

    async fn run_batch<T, F, Fut>(
        &self,
        kind: &'static str,
        items: Vec<TransferItem>,
        op: F,
    ) -> BatchReport<T>
    where
        T: Send + 'static,
        F: Fn(Arc<HandlePool<S>>, TransferItem) -> Fut,
        Fut: Future<Output = Result<T, FailedItem>> + Send + 'static,
    {
        // TODO: wrap each task in tokio::time::timeout once a per-item deadline is configurable.
        let outcomes = stream::iter(items)
            .map(|item| {
                let fallback = item.clone();
                let task = tokio::spawn(op(Arc::clone(&self.pool), item));
                async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(err) => Err(FailedItem {
                            item: fallback,
                            error: TransferError::Aborted(err.to_string()),
                        }),
                    }
                }
            })
            .buffer_unordered(self.config.workers.max(1));
        let mut outcomes = pin!(outcomes);

        let mut report = BatchReport::default();
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(value) => report.succeeded.push(value),
                Err(failed) => {
                    warn!(
                        kind,
                        item = %failed.item.name,
                        error = %failed.error,
                        "transfer failed"
                    );
                    report.failed.push(failed);
                }
            }
        }
        info!(
            kind,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch finished"
        );
        report
    }
}

async fn download_one<S: RemoteStore>(
    pool: &HandlePool<S>,
    item: &TransferItem,
    limit: u64,
) -> Result<(String, u64), TransferError> {
    if item.size_bytes > limit {
        remove_quietly(&item.local_path).await;
        return Err(TransferError::SizeExceeded {
            size: item.size_bytes,
            limit,
        });
    }
    if let Some(parent) = item.local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let partial = partial_path(&item.local_path);
    let (hasher, bytes) = match stream_to_file(pool, item, &partial, limit).await {
        Ok(done) => done,
        Err(err) => {
            remove_quietly(&partial).await;
            return Err(err);
        }
    };

    let digest = match item.expected_digest.as_deref() {
        Some(expected) => {
            let verification = hasher.verify(expected);
            if !verification.matched {
                remove_quietly(&partial).await;
                return Err(TransferError::IntegrityMismatch {
                    expected: expected.trim().to_ascii_lowercase(),
                    actual: verification.actual,
                });
            }
            verification.actual
        }
        None => hasher.finish(),
    };

    tokio::fs::rename(&partial, &item.local_path).await?;
    info!(item = %item.name, bytes, path = %item.local_path.display(), "downloaded");
    Ok((digest, bytes))
}

async fn stream_to_file<S: RemoteStore>(
    pool: &HandlePool<S>,
    item: &TransferItem,
    partial: &Path,
    limit: u64,
) -> Result<(ContentHasher, u64), TransferError> {
    let handle = pool.acquire().await?;
    let mut stream = handle.download(&item.source_id).await?;
    let mut file = tokio::fs::File::create(partial).await?;
    let mut hasher = ContentHasher::new();
    let mut written = 0u64;
    let mut progress = Progress::new(item.size_bytes);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(TransferError::SizeExceeded {
                size: written,
                limit,
            });
        }
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        if let Some(fraction) = progress.advance(written) {
            debug!(item = %item.name, progress = fraction, "downloading");
        }
    }
    drop(handle);

    file.flush().await?;
    file.sync_all().await?;
    Ok((hasher, written))
}

async fn upload_one<S: RemoteStore>(
    pool: &HandlePool<S>,
    item: &TransferItem,
) -> Result<String, TransferError> {
    // Fail on a missing local file before tying up a handle.
    tokio::fs::metadata(&item.local_path).await?;
    let handle = pool.acquire().await?;
    let id = handle
        .upload(
            &item.name,
            &item.mime_type,
            &item.destination_folder_id,
            &item.local_path,
        )
        .await?;
    info!(item = %item.name, %id, "uploaded");
    Ok(id)
}

struct Progress {
    total: u64,
    reported: u8,
}

impl Progress {
    fn new(total: u64) -> Self {
        Self { total, reported: 0 }
    }

    fn advance(&mut self, done: u64) -> Option<f32> {
        let fraction = if self.total == 0 {
            1.0
        } else {
            (done as f64 / self.total as f64).min(1.0) as f32
        };
        let quarter = (fraction * 4.0).floor() as u8;
        if quarter > self.reported {
            self.reported = quarter;
            Some(fraction)
        } else {
            None
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed local artifact"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove local artifact"),
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
#[path = "transfer_tests.rs"]
mod tests;
