use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::fs;

use super::{StoreError, StoreResult};

/// Durable object placed at a deterministic key, addressable at `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub location: String,
}

/// Durable object storage. `delete` treats a missing object as success;
/// a dangling orphan is preferable to a blocked pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, path: &Path, content_type: &str) -> StoreResult<StoredObject>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
    /// Maps a public location back to its storage key; `None` when the
    /// location belongs to another origin.
    fn key_for_location(&self, location: &str) -> Option<String>;
}

/// REST object gateway client. Objects live at
/// `{endpoint}/{bucket}/{key}` and are served publicly from
/// `{public_base_url}/{key}`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
    public_base_url: String,
}

impl HttpObjectStore {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: trim_slash(endpoint.into()),
            bucket: bucket.into(),
            public_base_url: trim_slash(public_base_url.into()),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    pub fn public_location(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    keys: Vec<String>,
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, path: &Path, content_type: &str) -> StoreResult<StoredObject> {
        let bytes = fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let response = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| StoreError::Upload {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(StoreError::Upload {
                key: key.to_string(),
                reason: format!("gateway answered {}", response.status()),
            });
        }
        Ok(StoredObject {
            key: key.to_string(),
            location: self.public_location(key),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let response = self
            .client
            .delete(self.object_url(key))
            .send()
            .await
            .map_err(|err| StoreError::Delete {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::Delete {
                key: key.to_string(),
                reason: format!("gateway answered {status}"),
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/{}", self.endpoint, self.bucket))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|err| StoreError::List {
                prefix: prefix.to_string(),
                reason: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(StoreError::List {
                prefix: prefix.to_string(),
                reason: format!("gateway answered {}", response.status()),
            });
        }
        let listing: ListResponse = response.json().await.map_err(|err| StoreError::List {
            prefix: prefix.to_string(),
            reason: err.to_string(),
        })?;
        Ok(listing.keys)
    }

    fn key_for_location(&self, location: &str) -> Option<String> {
        location
            .strip_prefix(&self.public_base_url)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .filter(|key| !key.is_empty())
    }
}

fn trim_slash(mut value: String) -> String {
    while value.ends_with('/') {
        value.pop();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_round_trip() {
        let store = HttpObjectStore::new(
            Client::new(),
            "http://127.0.0.1:9000/",
            "assets",
            "https://assets.example.org/",
        );
        let location = store.public_location("2024/01/publisher_42/abc.mp4");
        assert_eq!(
            location,
            "https://assets.example.org/2024/01/publisher_42/abc.mp4"
        );
        assert_eq!(
            store.key_for_location(&location).as_deref(),
            Some("2024/01/publisher_42/abc.mp4")
        );
        assert_eq!(store.key_for_location("https://elsewhere.org/x.mp4"), None);
    }
}
