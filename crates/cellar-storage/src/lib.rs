//! Sheet fetching, immutable source snapshots and atomic artifact writes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cellar-storage";

pub const DEFAULT_SHEETS_HOST: &str = "https://docs.google.com/spreadsheets/d";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A single sheet of a public spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetSource {
    pub host: String,
    pub spreadsheet_id: String,
    pub sheet_id: String,
}

impl SheetSource {
    pub fn new(spreadsheet_id: impl Into<String>, sheet_id: impl Into<String>) -> Self {
        Self {
            host: DEFAULT_SHEETS_HOST.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            sheet_id: sheet_id.into(),
        }
    }

    pub fn export_url(&self) -> String {
        format!(
            "{}/{}/export?format=csv&gid={}",
            self.host.trim_end_matches('/'),
            self.spreadsheet_id,
            self.sheet_id
        )
    }

    /// Short label used for snapshot paths and log fields.
    pub fn label(&self) -> String {
        format!("{}-gid{}", self.spreadsheet_id, self.sheet_id)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedSheet {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: String,
}

/// Every variant means the source is unavailable for this run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("spreadsheet at {url} was not found or is not publicly accessible")]
    NotPublic { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("sheet export from {url} is not valid UTF-8")]
    Decode { url: String },
}

/// Retrieves the current contents of a sheet as CSV text.
///
/// Implementations make exactly one attempt; retrying is left to the caller.
#[async_trait]
pub trait SheetFetcher: Send + Sync {
    async fn fetch_sheet(&self, source: &SheetSource) -> Result<FetchedSheet, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn is_access_denied(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED
    )
}

#[async_trait]
impl SheetFetcher for HttpFetcher {
    async fn fetch_sheet(&self, source: &SheetSource) -> Result<FetchedSheet, FetchError> {
        let url = source.export_url();
        let span = tracing::info_span!(
            "sheet_fetch",
            spreadsheet_id = %source.spreadsheet_id,
            sheet_id = %source.sheet_id
        );

        let result: Result<FetchedSheet, FetchError> = async move {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.clone(),
                    source,
                })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if is_access_denied(status) {
                return Err(FetchError::NotPublic { url });
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            // Private sheets answer with a sign-in page instead of an error status.
            let is_html = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/html"));
            if is_html {
                return Err(FetchError::NotPublic { url });
            }

            let bytes = resp.bytes().await.map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;
            let body = String::from_utf8(bytes.to_vec())
                .map_err(|_| FetchError::Decode { url: url.clone() })?;

            info!(bytes = body.len(), "downloaded sheet export");
            Ok(FetchedSheet {
                url,
                fetched_at: Utc::now(),
                body,
            })
        }
        .instrument(span)
        .await;
        result
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once store for raw source exports.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_label)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = sha256_hex(bytes);
        let relative_path =
            self.snapshot_relative_path(fetched_at, source_label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            debug!(path = %absolute_path.display(), "snapshot already stored");
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Writes `bytes` to a temp file beside `path` and renames it into place, so
/// readers see either the previous file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<WrittenFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenFile {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn export_url_targets_csv_endpoint() {
        let mut source = SheetSource::new("abc123", "0");
        assert_eq!(
            source.export_url(),
            "https://docs.google.com/spreadsheets/d/abc123/export?format=csv&gid=0"
        );
        source.host = "http://localhost:9000/sheets/".to_string();
        assert_eq!(
            source.export_url(),
            "http://localhost:9000/sheets/abc123/export?format=csv&gid=0"
        );
    }

    #[test]
    fn access_denied_statuses() {
        assert!(is_access_denied(StatusCode::NOT_FOUND));
        assert!(is_access_denied(StatusCode::FORBIDDEN));
        assert!(!is_access_denied(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn snapshots_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, "sheet-gid0", "csv", b"name,count\nRye,1\n")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, "sheet-gid0", "csv", b"name,count\nRye,1\n")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("src/data/out.ts");

        write_atomic(&path, b"first").await.expect("first write");
        let written = write_atomic(&path, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        assert_eq!(written.content_hash, sha256_hex(b"second"));
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
