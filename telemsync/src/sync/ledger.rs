use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ledger {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("ledger {path:?} is malformed at line {line}")]
    Malformed { path: PathBuf, line: usize },
    #[error("failed to write ledger {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub path: PathBuf,
    pub enabled: bool,
    pub fresh_start: bool,
    pub write_back: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Written(usize),
    Skipped,
}

#[derive(Debug)]
pub struct DedupLedger {
    path: PathBuf,
    enabled: bool,
    write_back: bool,
    ids: Mutex<HashSet<String>>,
}

impl DedupLedger {
    pub async fn load(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let ids = if !config.enabled {
            debug!("ledger disabled");
            HashSet::new()
        } else if config.fresh_start {
            info!(path = %config.path.display(), "starting with a fresh ledger");
            HashSet::new()
        } else {
            read_ids(&config.path).await?
        };
        Ok(Self {
            path: config.path.clone(),
            enabled: config.enabled,
            write_back: config.enabled && config.write_back,
            ids: Mutex::new(ids),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids().contains(id)
    }

    pub fn add(&self, id: impl Into<String>) -> bool {
        if !self.enabled {
            return false;
        }
        self.ids().insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn persist(&self) -> Result<Persisted, LedgerError> {
        if !self.write_back {
            return Ok(Persisted::Skipped);
        }
        let mut ids: Vec<String> = self.ids().iter().cloned().collect();
        // Sorted, so an unchanged set rewrites an identical file.
        ids.sort_unstable();
        let mut content = String::with_capacity(ids.iter().map(|id| id.len() + 1).sum());
        for id in &ids {
            content.push_str(id);
            content.push('\n');
        }

        let write_err = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(write_err)?;
        debug!(path = %self.path.display(), entries = ids.len(), "ledger written");
        Ok(Persisted::Written(ids.len()))
    }

    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_ids(path: &Path) -> Result<HashSet<String>, LedgerError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no ledger yet, starting empty");
            return Ok(HashSet::new());
        }
        Err(source) => {
            return Err(LedgerError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut ids = HashSet::new();
    for (index, line) in content.lines().enumerate() {
        let id = line.trim();
        if id.is_empty() {
            continue;
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(LedgerError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
            });
        }
        ids.insert(id.to_string());
    }
    debug!(path = %path.display(), entries = ids.len(), "ledger loaded");
    Ok(ids)
}
