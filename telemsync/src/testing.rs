//! In-memory [`RemoteStore`] for tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;

use crate::remote::{ContentStream, RemoteError, RemoteFile, RemoteStore};
use crate::sync::integrity::ContentHasher;
use crate::sync::tree::FolderRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListFolders,
    ListFiles { parent_id: String },
    AllocateIds(usize),
    CreateFolder { name: String, id: String, parent_id: String },
    Download(String),
    Upload { name: String, parent_id: String },
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub content: Vec<u8>,
    pub sha256: Option<String>,
    pub declared_size: u64,
    pub uploaded: bool,
}

#[derive(Debug, Default)]
pub struct State {
    pub folders: Vec<FolderRecord>,
    pub files: Vec<StoredFile>,
    pub calls: Vec<Call>,
    pub fail_allocate: bool,
    pub short_allocate: bool,
    pub fail_create: HashSet<String>,
    pub fail_download: HashSet<String>,
    pub fail_upload: HashSet<String>,
    pub latency: Duration,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    next_id: usize,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn with_folders(folders: &[(&str, &str, Option<&str>)]) -> Self {
        let store = Self::default();
        store.state().folders = folders
            .iter()
            .map(|(name, id, parent)| FolderRecord {
                name: name.to_string(),
                id: id.to_string(),
                parent_id: parent.map(str::to_string),
            })
            .collect();
        store
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Adds a source file whose listed checksum matches its content.
    pub fn add_file(&self, parent_id: &str, name: &str, content: &[u8]) -> String {
        let mut hasher = ContentHasher::new();
        hasher.update(content);
        self.add_file_with(parent_id, name, content, Some(hasher.finish()))
    }

    pub fn add_file_with(
        &self,
        parent_id: &str,
        name: &str,
        content: &[u8],
        sha256: Option<String>,
    ) -> String {
        let mut state = self.state();
        let id = state.fresh_id("file");
        state.files.push(StoredFile {
            id: id.clone(),
            name: name.to_string(),
            parent_id: parent_id.to_string(),
            content: content.to_vec(),
            sha256,
            declared_size: content.len() as u64,
            uploaded: false,
        });
        id
    }

    pub fn uploads(&self) -> Vec<StoredFile> {
        self.state()
            .files
            .iter()
            .filter(|file| file.uploaded)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    async fn busy(&self) -> InFlight {
        let latency = {
            let mut state = self.state();
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            state.latency
        };
        let guard = InFlight {
            state: Arc::clone(&self.state),
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }
}

impl State {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn folder_exists(&self, id: &str) -> bool {
        self.folders.iter().any(|folder| folder.id == id)
    }
}

struct InFlight {
    state: Arc<Mutex<State>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight -= 1;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_folders(&self) -> Result<Vec<FolderRecord>, RemoteError> {
        self.record(Call::ListFolders);
        Ok(self.state().folders.clone())
    }

    async fn list_files(
        &self,
        parent_id: &str,
        name_contains: &[&str],
    ) -> Result<Vec<RemoteFile>, RemoteError> {
        self.record(Call::ListFiles {
            parent_id: parent_id.to_string(),
        });
        Ok(self
            .state()
            .files
            .iter()
            .filter(|file| file.parent_id == parent_id)
            .filter(|file| name_contains.iter().all(|needle| file.name.contains(needle)))
            .map(|file| RemoteFile {
                id: file.id.clone(),
                name: file.name.clone(),
                sha256: file.sha256.clone(),
                size: file.declared_size,
            })
            .collect())
    }

    async fn allocate_ids(&self, count: usize) -> Result<Vec<String>, RemoteError> {
        self.record(Call::AllocateIds(count));
        let mut state = self.state();
        if state.fail_allocate {
            return Err(RemoteError::Rejected("id allocation unavailable".into()));
        }
        let count = if state.short_allocate {
            count.saturating_sub(1)
        } else {
            count
        };
        Ok((0..count).map(|_| state.fresh_id("folder")).collect())
    }

    async fn create_folder(
        &self,
        name: &str,
        id: &str,
        parent_id: &str,
    ) -> Result<(), RemoteError> {
        self.record(Call::CreateFolder {
            name: name.to_string(),
            id: id.to_string(),
            parent_id: parent_id.to_string(),
        });
        let _busy = self.busy().await;
        let mut state = self.state();
        if state.fail_create.contains(name) {
            return Err(RemoteError::Rejected(format!("cannot create {name}")));
        }
        if !state.folder_exists(parent_id) {
            return Err(RemoteError::Rejected(format!(
                "parent {parent_id} of {name} does not exist"
            )));
        }
        state.folders.push(FolderRecord {
            name: name.to_string(),
            id: id.to_string(),
            parent_id: Some(parent_id.to_string()),
        });
        Ok(())
    }

    async fn download(&self, file_id: &str) -> Result<ContentStream, RemoteError> {
        self.record(Call::Download(file_id.to_string()));
        let _busy = self.busy().await;
        let state = self.state();
        if state.fail_download.contains(file_id) {
            return Err(RemoteError::Rejected(format!("download of {file_id} failed")));
        }
        let file = state
            .files
            .iter()
            .find(|file| file.id == file_id)
            .ok_or_else(|| RemoteError::Rejected(format!("no such file {file_id}")))?;
        let chunks: Vec<Result<Bytes, RemoteError>> = file
            .content
            .chunks(3)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn upload(
        &self,
        name: &str,
        _mime_type: &str,
        parent_id: &str,
        source: &Path,
    ) -> Result<String, RemoteError> {
        self.record(Call::Upload {
            name: name.to_string(),
            parent_id: parent_id.to_string(),
        });
        let _busy = self.busy().await;
        let content = tokio::fs::read(source)
            .await
            .map_err(|err| RemoteError::Rejected(format!("cannot read {source:?}: {err}")))?;
        let mut state = self.state();
        if state.fail_upload.contains(name) {
            return Err(RemoteError::Rejected(format!("upload of {name} rejected")));
        }
        if !state.folder_exists(parent_id) {
            return Err(RemoteError::Rejected(format!("no such folder {parent_id}")));
        }
        let id = state.fresh_id("upload");
        state.files.push(StoredFile {
            id: id.clone(),
            name: name.to_string(),
            parent_id: parent_id.to_string(),
            declared_size: content.len() as u64,
            content,
            sha256: None,
            uploaded: true,
        });
        Ok(id)
    }
}
