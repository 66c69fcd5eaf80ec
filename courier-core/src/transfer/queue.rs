use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::document::{Asset, DocumentKind};
use crate::fetch::FetchedResource;

use super::error::{TransferError, TransferResult};
use super::{FetchStage, FinalizedTransfer, TransferCoordinator};

const QUEUE_DEPTH: usize = 64;

/// Payload of the download queue. Serializable so an external broker can
/// carry it unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub request_id: String,
    pub asset: Asset,
}

/// Payload of the upload queue: the staged resource produced by a
/// download worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub request_id: String,
    pub asset: Asset,
    pub resource: FetchedResource,
}

/// Queue-based deployment mode: downloads and uploads travel through two
/// independent queues, each drained by its own concurrency-limited worker
/// pool. Message handling is at-least-once safe; a message whose request
/// is no longer tracked is logged and dropped.
pub struct TransferQueues {
    coordinator: Arc<TransferCoordinator>,
    download_tx: mpsc::Sender<DownloadJob>,
    workers: Vec<JoinHandle<()>>,
}

impl TransferQueues {
    pub fn start(
        coordinator: Arc<TransferCoordinator>,
        download_workers: usize,
        upload_workers: usize,
    ) -> Self {
        let (download_tx, download_rx) = mpsc::channel::<DownloadJob>(QUEUE_DEPTH);
        let (upload_tx, upload_rx) = mpsc::channel::<UploadJob>(QUEUE_DEPTH);
        let download_rx = Arc::new(Mutex::new(download_rx));
        let upload_rx = Arc::new(Mutex::new(upload_rx));

        let mut workers = Vec::new();
        for _ in 0..download_workers.max(1) {
            workers.push(tokio::spawn(run_download_worker(
                coordinator.clone(),
                download_rx.clone(),
                upload_tx.clone(),
            )));
        }
        for _ in 0..upload_workers.max(1) {
            workers.push(tokio::spawn(run_upload_worker(
                coordinator.clone(),
                upload_rx.clone(),
            )));
        }

        Self {
            coordinator,
            download_tx,
            workers,
        }
    }

    /// Admits a mutation request, enqueues one download job per asset that
    /// needs a transfer, and waits for the last completion to settle the
    /// request.
    pub async fn submit(
        &self,
        kind: DocumentKind,
        document: Value,
    ) -> TransferResult<FinalizedTransfer> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let prepared = self
            .coordinator
            .prepare(kind, document, Some(completion_tx))
            .await?;

        if prepared.to_transfer.is_empty() {
            self.coordinator.settle(&prepared.request_id).await;
        } else {
            for asset in prepared.to_transfer {
                let job = DownloadJob {
                    request_id: prepared.request_id.clone(),
                    asset,
                };
                if self.download_tx.send(job).await.is_err() {
                    let error =
                        TransferError::Aborted("download queue is not accepting work".into());
                    self.coordinator.fail(&prepared.request_id, error).await;
                    break;
                }
            }
        }

        completion_rx
            .await
            .map_err(|_| TransferError::Aborted("completion channel dropped".into()))?
    }

    /// Ingress for download messages delivered by an external broker.
    /// Consumers tolerate duplicates: a job whose request already settled
    /// is dropped by the worker, not an error.
    pub async fn publish_download(&self, job: DownloadJob) -> TransferResult<()> {
        self.download_tx
            .send(job)
            .await
            .map_err(|_| TransferError::Aborted("download queue is not accepting work".into()))
    }

    /// Stops accepting work and waits for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.download_tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn run_download_worker(
    coordinator: Arc<TransferCoordinator>,
    download_rx: Arc<Mutex<mpsc::Receiver<DownloadJob>>>,
    upload_tx: mpsc::Sender<UploadJob>,
) {
    loop {
        let job = { download_rx.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        if coordinator
            .tracker()
            .with_request(&job.request_id, |_| ())
            .is_none()
        {
            warn!(request_id = %job.request_id, "stale download message dropped");
            continue;
        }
        match coordinator.fetch_stage(&job.request_id, &job.asset).await {
            Ok(FetchStage::Resolved) => coordinator.maybe_settle(&job.request_id).await,
            Ok(FetchStage::NeedsUpload(resource)) => {
                let upload = UploadJob {
                    request_id: job.request_id.clone(),
                    asset: job.asset,
                    resource,
                };
                if upload_tx.send(upload).await.is_err() {
                    let error =
                        TransferError::Aborted("upload queue is not accepting work".into());
                    coordinator.fail(&job.request_id, error).await;
                }
            }
            Err(TransferError::UnknownRequest(request_id)) => {
                warn!(%request_id, "download finished for untracked request, dropped");
            }
            Err(error) => coordinator.fail(&job.request_id, error).await,
        }
    }
}

async fn run_upload_worker(
    coordinator: Arc<TransferCoordinator>,
    upload_rx: Arc<Mutex<mpsc::Receiver<UploadJob>>>,
) {
    loop {
        let job = { upload_rx.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        if coordinator
            .tracker()
            .with_request(&job.request_id, |_| ())
            .is_none()
        {
            warn!(request_id = %job.request_id, "stale upload message dropped");
            continue;
        }
        match coordinator
            .upload_stage(&job.request_id, &job.asset, &job.resource)
            .await
        {
            Ok(()) => coordinator.maybe_settle(&job.request_id).await,
            Err(TransferError::UnknownRequest(request_id)) => {
                warn!(%request_id, "upload finished for untracked request, dropped");
            }
            Err(error) => coordinator.fail(&job.request_id, error).await,
        }
    }
}
