use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt, future, stream};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const PAGE_SIZE: u32 = 1000;
const MULTIPART_BOUNDARY: &str = "telemsync_multipart_boundary";

/// MIME type Drive uses to mark a file as a folder.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FOLDER_FIELDS: &str = "nextPageToken, files(id, name, parents)";
const FILE_FIELDS: &str = "nextPageToken, files(id, name, sha256Checksum, size, parents)";

/// Chunked body of a media download.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DriveError>> + Send>>;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lists every non-trashed folder visible to the credentials, following pagination.
    pub async fn list_folders(&self) -> Result<Vec<DriveFolder>, DriveError> {
        let query = format!("mimeType = '{FOLDER_MIME_TYPE}' and trashed = false");
        self.list_all(&query, FOLDER_FIELDS).await
    }

    /// Lists files directly under `parent_id` whose names contain every filter.
    pub async fn list_files(
        &self,
        parent_id: &str,
        name_contains: &[&str],
    ) -> Result<Vec<DriveFile>, DriveError> {
        let mut conditions: Vec<String> = name_contains
            .iter()
            .map(|needle| format!("name contains {}", quote(needle)))
            .collect();
        conditions.push(format!("{} in parents", quote(parent_id)));
        conditions.push(format!("mimeType != '{FOLDER_MIME_TYPE}'"));
        conditions.push("trashed = false".to_string());
        self.list_all(&conditions.join(" and "), FILE_FIELDS).await
    }

    pub async fn generate_ids(&self, count: usize) -> Result<Vec<String>, DriveError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut url = self.endpoint("/drive/v3/files/generateIds")?;
        url.query_pairs_mut()
            .append_pair("count", &count.to_string())
            .append_pair("space", "drive")
            .append_pair("type", "files");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let payload: GeneratedIds = Self::handle_response(response).await?;
        Ok(payload.ids)
    }

    /// Creates a folder under `parent_id` using an id obtained from [`Self::generate_ids`].
    pub async fn create_folder(
        &self,
        name: &str,
        id: &str,
        parent_id: &str,
    ) -> Result<String, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", "id");
        let body = FileMetadata {
            id: Some(id),
            name,
            mime_type: FOLDER_MIME_TYPE,
            parents: vec![parent_id],
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let created: CreatedFile = Self::handle_response(response).await?;
        Ok(created.id)
    }

    /// Opens the content of `file_id` as a chunk stream.
    pub async fn download(&self, file_id: &str) -> Result<ByteStream, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("acknowledgeAbuse", "true");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api { status, body });
        }
        Ok(Box::pin(response.bytes_stream().map_err(DriveError::from)))
    }

    /// Multipart upload of `source` into `parent_id`. Returns the new file id.
    pub async fn upload_file(
        &self,
        name: &str,
        mime_type: &str,
        parent_id: &str,
        source: &Path,
    ) -> Result<String, DriveError> {
        let mut url = self.endpoint("/upload/drive/v3/files")?;
        url.query_pairs_mut()
            .append_pair("uploadType", "multipart")
            .append_pair("fields", "id");

        let metadata = serde_json::to_string(&FileMetadata {
            id: None,
            name,
            mime_type,
            parents: vec![parent_id],
        })?;
        let head = Bytes::from(format!(
            "--{MULTIPART_BOUNDARY}\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\r\n\
             {metadata}\r\n\
             --{MULTIPART_BOUNDARY}\r\n\
             Content-Type: {mime_type}\r\n\r\n"
        ));
        let tail = Bytes::from(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n"));

        let file = tokio::fs::File::open(source).await?;
        let file_len = file.metadata().await?.len();
        let content_length = head.len() as u64 + file_len + tail.len() as u64;
        let body = stream::once(future::ready(Ok::<_, std::io::Error>(head)))
            .chain(ReaderStream::new(file))
            .chain(stream::once(future::ready(Ok(tail))));

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .header(header::CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        let created: CreatedFile = Self::handle_response(response).await?;
        Ok(created.id)
    }

    async fn list_all<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        fields: &str,
    ) -> Result<Vec<T>, DriveError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint("/drive/v3/files")?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs
                    .append_pair("q", query)
                    .append_pair("fields", fields)
                    .append_pair("pageSize", &PAGE_SIZE.to_string());
                if let Some(token) = page_token.as_deref() {
                    pairs.append_pair("pageToken", token);
                }
            }
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.token)
                .send()
                .await?;
            let page: FileList<T> = Self::handle_response(response).await?;
            items.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(items)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Quotes a value for use inside a Drive `q` expression.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DriveFolder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DriveFolder {
    pub fn parent_id(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
    // Drive encodes int64 fields as JSON strings.
    #[serde(default, deserialize_with = "string_u64")]
    pub size: Option<u64>,
    #[serde(default)]
    pub parents: Vec<String>,
}

fn string_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(value)) => Ok(Some(value)),
        Some(Raw::Text(text)) => text.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList<T> {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default = "Vec::new")]
    files: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct GeneratedIds {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    name: &'a str,
    mime_type: &'a str,
    parents: Vec<&'a str>,
}
