//! Boundary to the remote store.
//!
//! The sync core only talks to [`RemoteStore`]; [`DriveStore`] backs it with the
//! Google Drive client.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use drive_core::{DriveClient, DriveError, DriveFile, DriveFolder};
use futures_util::{Stream, TryStreamExt};
use thiserror::Error;

use crate::sync::tree::FolderRecord;

pub type ContentStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("remote rejected request: {0}")]
    Rejected(String),
}

/// A file listed under a remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub sha256: Option<String>,
    pub size: u64,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_folders(&self) -> Result<Vec<FolderRecord>, RemoteError>;

    /// Files directly under `parent_id` whose names contain every filter.
    async fn list_files(
        &self,
        parent_id: &str,
        name_contains: &[&str],
    ) -> Result<Vec<RemoteFile>, RemoteError>;

    async fn allocate_ids(&self, count: usize) -> Result<Vec<String>, RemoteError>;

    async fn create_folder(&self, name: &str, id: &str, parent_id: &str)
    -> Result<(), RemoteError>;

    async fn download(&self, file_id: &str) -> Result<ContentStream, RemoteError>;

    /// Uploads `source` and returns the id the remote assigned to it.
    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        parent_id: &str,
        source: &Path,
    ) -> Result<String, RemoteError>;
}

/// [`RemoteStore`] over the Drive v3 API. Each instance owns its own HTTP
/// connection pool, so one instance makes one pool handle.
#[derive(Clone)]
pub struct DriveStore {
    client: DriveClient,
}

impl DriveStore {
    pub fn new(client: DriveClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn list_folders(&self) -> Result<Vec<FolderRecord>, RemoteError> {
        let folders = self.client.list_folders().await?;
        Ok(folders.into_iter().map(FolderRecord::from).collect())
    }

    async fn list_files(
        &self,
        parent_id: &str,
        name_contains: &[&str],
    ) -> Result<Vec<RemoteFile>, RemoteError> {
        let files = self.client.list_files(parent_id, name_contains).await?;
        Ok(files.into_iter().map(RemoteFile::from).collect())
    }

    async fn allocate_ids(&self, count: usize) -> Result<Vec<String>, RemoteError> {
        Ok(self.client.generate_ids(count).await?)
    }

    async fn create_folder(
        &self,
        name: &str,
        id: &str,
        parent_id: &str,
    ) -> Result<(), RemoteError> {
        let created = self.client.create_folder(name, id, parent_id).await?;
        if created != id {
            return Err(RemoteError::Rejected(format!(
                "folder {name} was created as {created} instead of {id}"
            )));
        }
        Ok(())
    }

    async fn download(&self, file_id: &str) -> Result<ContentStream, RemoteError> {
        let stream = self.client.download(file_id).await?;
        Ok(Box::pin(stream.map_err(RemoteError::from)))
    }

    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        parent_id: &str,
        source: &Path,
    ) -> Result<String, RemoteError> {
        Ok(self
            .client
            .upload_file(name, mime_type, parent_id, source)
            .await?)
    }
}

impl From<DriveFolder> for FolderRecord {
    fn from(folder: DriveFolder) -> Self {
        Self {
            parent_id: folder.parent_id().map(str::to_string),
            name: folder.name,
            id: folder.id,
        }
    }
}

impl From<DriveFile> for RemoteFile {
    fn from(file: DriveFile) -> Self {
        Self {
            id: file.id,
            name: file.name,
            sha256: file.sha256_checksum,
            size: file.size.unwrap_or(0),
        }
    }
}
