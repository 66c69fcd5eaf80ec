mod probe;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hex::encode as hex_encode;
use md5::{Digest, Md5};
use reqwest::Client;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::config::CourierConfig;
use crate::document::MediaProperties;

pub use probe::{FfprobeProber, MediaProber};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("content type not allowed for {url}: {content_type}")]
    TypeNotAllowed { url: String, content_type: String },
    #[error("could not resolve a content type for {0}")]
    UnknownType(String),
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("asset at {url} exceeds the {limit_mb} MB size limit")]
    TooLarge { url: String, limit_mb: u64 },
    #[error("http client error: {0}")]
    Client(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        FetchError::Download {
            url: error
                .url()
                .map(|u| u.to_string())
                .unwrap_or_default(),
            reason: error.to_string(),
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Extensions the pipeline accepts beyond the blanket image/video/audio
/// prefixes, with the content type each resolves to.
const EXTENSION_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("srt", "application/x-subrip"),
    ("vtt", "text/vtt"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("rtf", "application/rtf"),
    ("html", "text/html"),
];

const OCTET_STREAM: &str = "application/octet-stream";

/// A remote asset copied into per-request staging, with its content hash.
/// Serializable so it can ride as a queue message payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FetchedResource {
    pub source_url: String,
    pub local_path: PathBuf,
    pub content_type: String,
    pub content_hash: String,
    pub extension: String,
    pub size_bytes: u64,
    pub media: Option<MediaProperties>,
}

impl FetchedResource {
    pub fn is_video(&self) -> bool {
        self.content_type.starts_with("video/")
    }
}

/// Downloads remote assets into a per-request staging directory, validating
/// content type up front and hashing bytes as they arrive.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    staging_root: PathBuf,
    prober: Arc<dyn MediaProber>,
    extra_extensions: HashSet<String>,
    max_asset_bytes: u64,
}

impl Fetcher {
    pub fn new(config: &CourierConfig) -> FetchResult<Self> {
        let fetch = &config.fetch;
        let client = Client::builder()
            .user_agent(fetch.user_agent.clone())
            .timeout(Duration::from_secs(fetch.request_timeout_seconds))
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self {
            client,
            staging_root: PathBuf::from(&config.paths.staging_dir),
            prober: Arc::new(FfprobeProber::new(fetch.probe_command.as_str())),
            extra_extensions: fetch
                .extra_allowed_extensions
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
            max_asset_bytes: config.limits.max_asset_size_mb * 1024 * 1024,
        })
    }

    pub fn with_prober(mut self, prober: Arc<dyn MediaProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = root.into();
        self
    }

    /// Validates, downloads and hashes one asset. The resulting file lives
    /// under `staging/<request_id>/` until [`Fetcher::cleanup`] runs.
    pub async fn fetch(&self, url: &str, request_id: &str) -> FetchResult<FetchedResource> {
        let content_type = self.resolve_content_type(url).await?;
        if !self.is_type_allowed(url, &content_type) {
            return Err(FetchError::TypeNotAllowed {
                url: url.to_string(),
                content_type,
            });
        }

        let extension = extension_of(url)
            .or_else(|| extension_for_type(&content_type))
            .unwrap_or_else(|| "bin".to_string());
        let staging = self.staging_root.join(request_id);
        fs::create_dir_all(&staging)
            .await
            .map_err(|source| FetchError::Io {
                path: staging.clone(),
                source,
            })?;
        let local_path = staging.join(format!("{}.{}", Uuid::new_v4(), extension));

        let (content_hash, size_bytes) = self.download(url, &local_path).await?;

        let media = if content_type.starts_with("video/") {
            match self.prober.probe(&local_path).await {
                Ok(props) if !props.is_empty() => Some(props),
                Ok(_) => None,
                Err(err) => {
                    warn!(url, error = %err, "media probe failed, continuing without properties");
                    None
                }
            }
        } else {
            None
        };

        Ok(FetchedResource {
            source_url: url.to_string(),
            local_path,
            content_type,
            content_hash,
            extension,
            size_bytes,
            media,
        })
    }

    /// Removes the staging directory of one request. Safe to call on every
    /// exit path; a missing directory is not an error.
    pub async fn cleanup(&self, request_id: &str) {
        let staging = self.staging_root.join(request_id);
        if let Err(err) = fs::remove_dir_all(&staging).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %err, "failed to clean staging directory");
            }
        }
    }

    async fn resolve_content_type(&self, url: &str) -> FetchResult<String> {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                return extension_of(url)
                    .and_then(|ext| type_for_extension(&ext))
                    .ok_or_else(|| FetchError::UnknownType(url.to_string()));
            }
        }
        let reported = match self.client.head(url).send().await {
            Ok(response) => response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| {
                    value
                        .split(';')
                        .next()
                        .unwrap_or(value)
                        .trim()
                        .to_ascii_lowercase()
                }),
            Err(err) => {
                warn!(url, error = %err, "content type probe failed");
                None
            }
        };
        // Servers that answer octet-stream are hiding the real type; fall
        // back to the extension.
        match reported {
            Some(content_type) if content_type != OCTET_STREAM => Ok(content_type),
            _ => extension_of(url)
                .and_then(|ext| type_for_extension(&ext))
                .ok_or_else(|| FetchError::UnknownType(url.to_string())),
        }
    }

    fn is_type_allowed(&self, url: &str, content_type: &str) -> bool {
        if content_type.starts_with("image/")
            || content_type.starts_with("video/")
            || content_type.starts_with("audio/")
        {
            return true;
        }
        if EXTENSION_TYPES.iter().any(|(_, t)| *t == content_type) {
            return true;
        }
        extension_of(url)
            .map(|ext| self.extra_extensions.contains(&ext))
            .unwrap_or(false)
    }

    async fn download(&self, url: &str, destination: &Path) -> FetchResult<(String, u64)> {
        let mut hasher = Md5::new();
        let mut written = 0u64;
        let mut file = fs::File::create(destination)
            .await
            .map_err(|source| FetchError::Io {
                path: destination.to_path_buf(),
                source,
            })?;

        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                let source_path = parsed.to_file_path().map_err(|_| FetchError::Download {
                    url: url.to_string(),
                    reason: "invalid file url".into(),
                })?;
                let bytes = fs::read(&source_path)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: source_path.clone(),
                        source,
                    })?;
                self.check_size(url, bytes.len() as u64)?;
                hasher.update(&bytes);
                file.write_all(&bytes)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: destination.to_path_buf(),
                        source,
                    })?;
                return Ok((hex_encode(hasher.finalize()), bytes.len() as u64));
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| FetchError::Download {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let data = chunk?;
            written += data.len() as u64;
            self.check_size(url, written)?;
            hasher.update(&data);
            file.write_all(&data)
                .await
                .map_err(|source| FetchError::Io {
                    path: destination.to_path_buf(),
                    source,
                })?;
        }
        file.flush().await.map_err(|source| FetchError::Io {
            path: destination.to_path_buf(),
            source,
        })?;
        Ok((hex_encode(hasher.finalize()), written))
    }

    fn check_size(&self, url: &str, bytes: u64) -> FetchResult<()> {
        if self.max_asset_bytes > 0 && bytes > self.max_asset_bytes {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit_mb: self.max_asset_bytes / (1024 * 1024),
            });
        }
        Ok(())
    }
}

fn extension_of(url: &str) -> Option<String> {
    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn type_for_extension(extension: &str) -> Option<String> {
    EXTENSION_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, content_type)| content_type.to_string())
}

fn extension_for_type(content_type: &str) -> Option<String> {
    EXTENSION_TYPES
        .iter()
        .find(|(_, t)| *t == content_type)
        .map(|(ext, _)| ext.to_string())
}
