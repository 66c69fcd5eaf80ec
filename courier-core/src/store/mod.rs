mod object;
mod stream;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::document::{DocumentKey, StreamInfo};
use crate::fetch::FetchedResource;

pub use object::{HttpObjectStore, ObjectStore, StoredObject};
pub use stream::{EncodePoller, EncodeState, EncodeStatus, HttpStreamProvider, StreamHandle, StreamProvider};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload failed for {key}: {reason}")]
    Upload { key: String, reason: String },
    #[error("delete failed for {key}: {reason}")]
    Delete { key: String, reason: String },
    #[error("list failed for prefix {prefix}: {reason}")]
    List { prefix: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("stream provider error: {0}")]
    Provider(String),
    #[error("encoding failed: {0}")]
    EncodeFailed(String),
    #[error("encoding status polling abandoned after {polls} attempts")]
    EncodeTimeout { polls: u32 },
    #[error("stream provider reported ready without a result")]
    MissingStreamResult,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Deterministic object key: date bucket, external key, content hash.
/// Re-uploading identical bytes for the same document lands on the same
/// key.
pub fn storage_key(
    key: &DocumentKey,
    date: DateTime<Utc>,
    content_hash: &str,
    extension: &str,
) -> String {
    format!(
        "{}/{:02}/{}_{}/{}.{}",
        date.year(),
        date.month(),
        key.site,
        key.post_id,
        content_hash,
        extension
    )
}

/// Result of pushing one fetched resource to durable storage (and, for
/// video, to the streaming provider).
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub object: StoredObject,
    pub stream: Option<StreamInfo>,
}

/// Pushes fetched resources to the object store and, for video sources,
/// to the streaming provider. Removal is best-effort by design.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    provider: Option<Arc<dyn StreamProvider>>,
    poller: EncodePoller,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        provider: Option<Arc<dyn StreamProvider>>,
        poller: EncodePoller,
    ) -> Self {
        Self {
            store,
            provider,
            poller,
        }
    }

    pub async fn upload(
        &self,
        resource: &FetchedResource,
        key: &DocumentKey,
        published: Option<DateTime<Utc>>,
    ) -> StoreResult<UploadOutcome> {
        let date = published.unwrap_or_else(Utc::now);
        let object_key = storage_key(key, date, &resource.content_hash, &resource.extension);
        let object = self
            .store
            .put(&object_key, &resource.local_path, &resource.content_type)
            .await?;
        info!(key = %object.key, hash = %resource.content_hash, "stored asset");

        let stream = match (&self.provider, resource.is_video()) {
            (Some(provider), true) => {
                let info = self
                    .poller
                    .upload(provider.as_ref(), &resource.local_path)
                    .await?;
                info!(uid = %info.uid, "stream encode complete");
                Some(info)
            }
            _ => None,
        };

        Ok(UploadOutcome { object, stream })
    }

    /// Deletes the stored object behind a public location. Failures and
    /// foreign locations are logged, never raised.
    pub async fn remove_location(&self, location: &str) {
        let Some(key) = self.store.key_for_location(location) else {
            warn!(location, "skipping delete of location outside managed storage");
            return;
        };
        match self.store.delete(&key).await {
            Ok(()) => info!(key = %key, "removed orphaned object"),
            Err(err) => warn!(key = %key, error = %err, "failed to remove orphaned object"),
        }
    }

    /// Deletes an encoded copy at the streaming provider. Best-effort.
    pub async fn remove_stream(&self, uid: &str) {
        let Some(provider) = &self.provider else {
            return;
        };
        match provider.remove(uid).await {
            Ok(()) => info!(uid, "removed orphaned stream"),
            Err(err) => warn!(uid, error = %err, "failed to remove orphaned stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_is_date_bucketed_and_stable() {
        let key = DocumentKey::new("publisher", 42);
        let date = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let first = storage_key(&key, date, "abc123", "mp4");
        let second = storage_key(&key, date, "abc123", "mp4");
        assert_eq!(first, "2024/01/publisher_42/abc123.mp4");
        assert_eq!(first, second);
    }
}
