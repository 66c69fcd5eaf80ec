use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::document::StreamInfo;

use super::{StoreError, StoreResult};

/// Opaque handle to an in-flight provider upload, polled until encoding
/// reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    Queued,
    InProgress,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct EncodeStatus {
    pub state: EncodeState,
    pub progress: Option<f64>,
    pub result: Option<StreamInfo>,
    pub message: Option<String>,
}

/// External streaming/transcoding provider. Uploads return immediately
/// with a handle; encoding completes asynchronously.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    async fn start_upload(&self, path: &Path) -> StoreResult<StreamHandle>;
    async fn poll_status(&self, handle: &StreamHandle) -> StoreResult<EncodeStatus>;
    async fn remove(&self, uid: &str) -> StoreResult<()>;
}

/// Drives a provider upload to completion by polling on a fixed interval,
/// giving up after `max_polls` attempts.
#[derive(Debug, Clone)]
pub struct EncodePoller {
    pub interval: Duration,
    pub max_polls: u32,
}

impl EncodePoller {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls,
        }
    }

    pub async fn upload(
        &self,
        provider: &dyn StreamProvider,
        path: &Path,
    ) -> StoreResult<StreamInfo> {
        let handle = provider.start_upload(path).await?;
        let mut polls = 0u32;
        loop {
            polls += 1;
            if polls > self.max_polls {
                return Err(StoreError::EncodeTimeout {
                    polls: self.max_polls,
                });
            }
            let status = provider.poll_status(&handle).await?;
            match status.state {
                EncodeState::Ready => {
                    return status.result.ok_or(StoreError::MissingStreamResult);
                }
                EncodeState::Error => {
                    return Err(StoreError::EncodeFailed(
                        status.message.unwrap_or_else(|| "unknown".into()),
                    ));
                }
                EncodeState::Queued | EncodeState::InProgress => {
                    debug!(
                        handle = %handle.0,
                        progress = status.progress.unwrap_or_default(),
                        "encode in progress"
                    );
                }
            }
            sleep(self.interval).await;
        }
    }
}

/// HTTP streaming provider client. Media is POSTed to the endpoint; the
/// returned uid is polled at `{endpoint}/{uid}` until encoding settles.
#[derive(Debug, Clone)]
pub struct HttpStreamProvider {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ProviderEnvelope {
    success: bool,
    #[serde(default)]
    errors: Vec<String>,
    result: Option<ProviderResult>,
}

#[derive(Debug, Deserialize)]
struct ProviderResult {
    uid: String,
    #[serde(default)]
    preview: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    status: Option<ProviderStatus>,
}

#[derive(Debug, Deserialize)]
struct ProviderStatus {
    state: String,
    #[serde(default, rename = "pctComplete")]
    pct_complete: Option<String>,
}

impl HttpStreamProvider {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        let mut endpoint = endpoint.into();
        while endpoint.ends_with('/') {
            endpoint.pop();
        }
        Self { client, endpoint }
    }

    async fn parse_envelope(response: reqwest::Response) -> StoreResult<ProviderEnvelope> {
        let envelope: ProviderEnvelope = response
            .json()
            .await
            .map_err(|err| StoreError::Provider(err.to_string()))?;
        if !envelope.success {
            return Err(StoreError::Provider(envelope.errors.join("; ")));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl StreamProvider for HttpStreamProvider {
    async fn start_upload(&self, path: &Path) -> StoreResult<StreamHandle> {
        let bytes = fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let response = self
            .client
            .post(&self.endpoint)
            .body(bytes)
            .send()
            .await
            .map_err(|err| StoreError::Provider(err.to_string()))?;
        let envelope = Self::parse_envelope(response).await?;
        let uid = envelope
            .result
            .map(|result| result.uid)
            .ok_or(StoreError::MissingStreamResult)?;
        Ok(StreamHandle(format!("{}/{}", self.endpoint, uid)))
    }

    async fn poll_status(&self, handle: &StreamHandle) -> StoreResult<EncodeStatus> {
        let response = self
            .client
            .get(&handle.0)
            .send()
            .await
            .map_err(|err| StoreError::Provider(err.to_string()))?;
        let envelope = Self::parse_envelope(response).await?;
        let result = envelope.result.ok_or(StoreError::MissingStreamResult)?;
        let raw_state = result
            .status
            .as_ref()
            .map(|status| status.state.as_str())
            .unwrap_or("queued");
        let progress = result
            .status
            .as_ref()
            .and_then(|status| status.pct_complete.as_deref())
            .and_then(|pct| pct.parse::<f64>().ok());
        let state = match raw_state {
            "ready" => EncodeState::Ready,
            "inprogress" => EncodeState::InProgress,
            "queued" => EncodeState::Queued,
            _ => EncodeState::Error,
        };
        let stream = if state == EncodeState::Ready {
            Some(StreamInfo {
                url: result.preview.clone().unwrap_or_default(),
                uid: result.uid.clone(),
                site: None,
                link: None,
                thumbnail: result.thumbnail.clone(),
            })
        } else {
            None
        };
        Ok(EncodeStatus {
            state,
            progress,
            result: stream,
            message: (state == EncodeState::Error).then(|| raw_state.to_string()),
        })
    }

    async fn remove(&self, uid: &str) -> StoreResult<()> {
        let response = self
            .client
            .delete(format!("{}/{}", self.endpoint, uid))
            .send()
            .await
            .map_err(|err| StoreError::Provider(err.to_string()))?;
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            warn!(uid, %status, "stream provider delete answered non-success");
            return Err(StoreError::Provider(format!(
                "delete answered {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedProvider {
        statuses: Mutex<Vec<EncodeStatus>>,
    }

    impl ScriptedProvider {
        fn new(mut statuses: Vec<EncodeStatus>) -> Self {
            statuses.reverse();
            Self {
                statuses: Mutex::new(statuses),
            }
        }
    }

    #[async_trait]
    impl StreamProvider for ScriptedProvider {
        async fn start_upload(&self, _path: &Path) -> StoreResult<StreamHandle> {
            Ok(StreamHandle("http://provider/media/u1".into()))
        }

        async fn poll_status(&self, _handle: &StreamHandle) -> StoreResult<EncodeStatus> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop()
                .expect("poll past script end"))
        }

        async fn remove(&self, _uid: &str) -> StoreResult<()> {
            Ok(())
        }
    }

    fn pending(state: EncodeState) -> EncodeStatus {
        EncodeStatus {
            state,
            progress: Some(10.0),
            result: None,
            message: None,
        }
    }

    fn ready() -> EncodeStatus {
        EncodeStatus {
            state: EncodeState::Ready,
            progress: Some(100.0),
            result: Some(StreamInfo {
                url: "https://player/video/u1".into(),
                uid: "u1".into(),
                site: None,
                link: None,
                thumbnail: None,
            }),
            message: None,
        }
    }

    #[tokio::test]
    async fn poller_waits_through_queue_and_resolves() {
        let provider = ScriptedProvider::new(vec![
            pending(EncodeState::Queued),
            pending(EncodeState::InProgress),
            ready(),
        ]);
        let poller = EncodePoller::new(Duration::from_millis(1), 10);
        let info = poller
            .upload(&provider, Path::new("/tmp/ignored"))
            .await
            .unwrap();
        assert_eq!(info.uid, "u1");
    }

    #[tokio::test]
    async fn poller_times_out_after_budget() {
        let provider =
            ScriptedProvider::new(vec![pending(EncodeState::InProgress); 5]);
        let poller = EncodePoller::new(Duration::from_millis(1), 3);
        let err = poller
            .upload(&provider, Path::new("/tmp/ignored"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EncodeTimeout { polls: 3 }));
    }

    #[tokio::test]
    async fn poller_surfaces_encode_errors() {
        let provider = ScriptedProvider::new(vec![EncodeStatus {
            state: EncodeState::Error,
            progress: None,
            result: None,
            message: Some("codec rejected".into()),
        }]);
        let poller = EncodePoller::new(Duration::from_millis(1), 10);
        let err = poller
            .upload(&provider, Path::new("/tmp/ignored"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EncodeFailed(reason) if reason == "codec rejected"));
    }
}
