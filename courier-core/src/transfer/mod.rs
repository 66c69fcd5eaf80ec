mod error;
mod queue;
mod tracker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CourierConfig;
use crate::document::{orphaned_assets, publish_date, Asset, DocumentKey, DocumentKind};
use crate::fetch::{FetchedResource, Fetcher};
use crate::index::{DocumentIndex, IndexQuery, IndexedDocument};
use crate::store::Uploader;

pub use error::{TransferError, TransferResult};
pub use queue::{DownloadJob, TransferQueues, UploadJob};
pub use tracker::{RequestTracker, TransferRequest};

/// Outcome of a completed transfer: the rewritten document as persisted,
/// its index id, and the storage locations reclaimed from the previous
/// version.
#[derive(Debug, Clone)]
pub struct FinalizedTransfer {
    pub index_id: String,
    pub document: Value,
    pub removed_locations: Vec<String>,
}

struct AssetContext {
    key: DocumentKey,
    published: Option<DateTime<Utc>>,
    indexed_assets: Vec<Asset>,
}

struct PreparedRequest {
    request_id: String,
    to_transfer: Vec<Asset>,
}

enum FetchStage {
    /// Hash matched an already-stored asset after download; nothing to
    /// upload.
    Resolved,
    NeedsUpload(FetchedResource),
}

/// Orchestrates one document mutation end to end: asset diffing, hash
/// dedup, concurrent fetch/upload fan-out, document rewrite, orphan
/// cleanup and index persistence.
#[derive(Clone)]
pub struct TransferCoordinator {
    fetcher: Fetcher,
    uploader: Uploader,
    index: Arc<dyn DocumentIndex>,
    tracker: RequestTracker,
    download_slots: Arc<Semaphore>,
    upload_slots: Arc<Semaphore>,
    find_retries: u32,
    find_retry_delay: Duration,
}

impl TransferCoordinator {
    pub fn new(
        fetcher: Fetcher,
        uploader: Uploader,
        index: Arc<dyn DocumentIndex>,
        config: &CourierConfig,
    ) -> Self {
        Self {
            fetcher,
            uploader,
            index,
            tracker: RequestTracker::new(),
            download_slots: Arc::new(Semaphore::new(config.limits.max_concurrent_downloads)),
            upload_slots: Arc::new(Semaphore::new(config.limits.max_concurrent_uploads)),
            find_retries: config.index.find_retries,
            find_retry_delay: config.index.find_retry_delay(),
        }
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Runs a full transfer for one document mutation and waits for it.
    /// Fails fast with [`TransferError::Collision`] when the document key
    /// already has a transfer in flight.
    pub async fn submit(
        &self,
        kind: DocumentKind,
        document: Value,
    ) -> TransferResult<FinalizedTransfer> {
        let prepared = self.prepare(kind, document, None).await?;
        let request_id = prepared.request_id;

        let mut tasks: JoinSet<TransferResult<()>> = JoinSet::new();
        for asset in prepared.to_transfer {
            let coordinator = self.clone();
            let task_request_id = request_id.clone();
            tasks.spawn(async move { coordinator.transfer_asset(&task_request_id, asset).await });
        }

        // Dispatched transfers run to completion even after a sibling
        // fails; the first error decides the request's fate.
        let mut first_error: Option<TransferError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result =
                joined.unwrap_or_else(|err| Err(TransferError::Aborted(err.to_string())));
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(error) => Err(self.abort(&request_id, error).await),
            None => self.finalize(&request_id).await,
        }
    }

    /// Removes a document and every stored asset it references. Storage
    /// and provider deletes are best-effort; the index delete is not.
    pub async fn delete(
        &self,
        kind: DocumentKind,
        key: &DocumentKey,
    ) -> TransferResult<Option<String>> {
        if self.tracker.find_by_key(key).is_some() {
            return Err(TransferError::Collision(key.clone()));
        }
        let Some(found) = self
            .index
            .find(kind, &IndexQuery::Key(key.clone()))
            .await?
        else {
            return Ok(None);
        };
        for asset in kind.model().get_assets(&found.body) {
            if asset.has_download_url() {
                self.uploader.remove_location(&asset.download_url).await;
            }
            if let Some(stream) = &asset.stream {
                self.uploader.remove_stream(&stream.uid).await;
            }
        }
        self.index.delete(kind, &found.id).await?;
        info!(%key, index_id = %found.id, "document and assets deleted");
        Ok(Some(found.id))
    }

    /// Lookup with bounded retry, for callers racing a fresh index write.
    pub async fn lookup(
        &self,
        kind: DocumentKind,
        query: &IndexQuery,
    ) -> TransferResult<IndexedDocument> {
        Ok(crate::index::find_with_retry(
            self.index.as_ref(),
            kind,
            query,
            self.find_retries,
            self.find_retry_delay,
        )
        .await?)
    }

    /// Admits a mutation request: collision check, previous-version load,
    /// cheap hash short-circuits, tracker registration. Returns the assets
    /// that still need a network transfer.
    async fn prepare(
        &self,
        kind: DocumentKind,
        mut document: Value,
        completion: Option<oneshot::Sender<TransferResult<FinalizedTransfer>>>,
    ) -> TransferResult<PreparedRequest> {
        let key = DocumentKey::from_value(&document).ok_or(TransferError::MissingKey)?;
        if self.tracker.find_by_key(&key).is_some() {
            return Err(TransferError::Collision(key));
        }

        let previous = self.index.find(kind, &IndexQuery::Key(key.clone())).await?;
        let (index_id, indexed_assets) = match &previous {
            Some(found) => (Some(found.id.clone()), kind.model().get_assets(&found.body)),
            None => (None, Vec::new()),
        };

        let model = kind.model();
        let mut to_transfer = Vec::new();
        for asset in model.get_assets(&document) {
            if !asset.has_download_url() {
                continue;
            }
            // The client echoed a hash we already store: rewrite from the
            // indexed copy and skip the network entirely.
            if let Some(stored) = indexed_assets
                .iter()
                .find(|stored| stored.hash_matches(&asset))
            {
                let mut rewritten = asset.clone();
                rewritten.download_url = stored.download_url.clone();
                rewritten.content_hash = stored.content_hash.clone();
                model.put_asset(&mut document, &rewritten);
                info!(%key, hash = rewritten.content_hash.as_deref().unwrap_or(""),
                    "hash match, transfer not required");
            } else {
                to_transfer.push(asset);
            }
        }

        let request_id = Uuid::new_v4().to_string();
        let request = TransferRequest {
            request_id: request_id.clone(),
            key: key.clone(),
            kind,
            published: publish_date(&document),
            document,
            index_id,
            indexed_assets,
            pending_downloads: to_transfer.len() as u32,
            pending_uploads: 0,
            completion,
        };
        self.tracker.register(request)?;
        info!(%key, %request_id, assets = to_transfer.len(), "transfer request admitted");
        Ok(PreparedRequest {
            request_id,
            to_transfer,
        })
    }

    async fn transfer_asset(&self, request_id: &str, asset: Asset) -> TransferResult<()> {
        match self.fetch_stage(request_id, &asset).await? {
            FetchStage::Resolved => Ok(()),
            FetchStage::NeedsUpload(resource) => {
                self.upload_stage(request_id, &asset, &resource).await
            }
        }
    }

    /// Downloads one asset. Either resolves it against an already-stored
    /// hash, or hands back the staged resource for the upload stage. The
    /// pending-upload counter is raised before the pending-download
    /// counter drops so the request can never look settled in between.
    async fn fetch_stage(
        &self,
        request_id: &str,
        asset: &Asset,
    ) -> TransferResult<FetchStage> {
        let context = self.asset_context(request_id)?;

        let fetched = {
            let _permit = self
                .download_slots
                .acquire()
                .await
                .map_err(|err| TransferError::Aborted(err.to_string()))?;
            info!(url = %asset.download_url, request_id, "downloading asset");
            self.fetcher.fetch(&asset.download_url, request_id).await
        };

        let fetched = match fetched {
            Ok(resource) => resource,
            Err(err) => {
                let _ = self
                    .tracker
                    .with_request(request_id, TransferRequest::pop_download);
                return Err(err.into());
            }
        };

        // Hash is only known after download: second dedup opportunity.
        if let Some(stored) = context
            .indexed_assets
            .iter()
            .find(|stored| stored.content_hash.as_deref() == Some(fetched.content_hash.as_str()))
        {
            let mut resolved = asset.clone();
            resolved.download_url = stored.download_url.clone();
            resolved.content_hash = stored.content_hash.clone();
            self.apply_asset(request_id, &resolved)?;
            let _ = self
                .tracker
                .with_request(request_id, TransferRequest::pop_download);
            info!(hash = %fetched.content_hash, "hash match after download, upload not required");
            return Ok(FetchStage::Resolved);
        }

        self.tracker
            .with_request(request_id, |request| {
                request.push_upload();
                request.pop_download();
            })
            .ok_or_else(|| TransferError::UnknownRequest(request_id.to_string()))?;
        Ok(FetchStage::NeedsUpload(fetched))
    }

    /// Pushes a staged resource to storage (and the streaming provider for
    /// video) and rewrites the asset in the working document.
    async fn upload_stage(
        &self,
        request_id: &str,
        asset: &Asset,
        resource: &FetchedResource,
    ) -> TransferResult<()> {
        let context = self.asset_context(request_id)?;

        let outcome = {
            let _permit = self
                .upload_slots
                .acquire()
                .await
                .map_err(|err| TransferError::Aborted(err.to_string()))?;
            self.uploader
                .upload(resource, &context.key, context.published)
                .await
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = self
                    .tracker
                    .with_request(request_id, TransferRequest::pop_upload);
                return Err(err.into());
            }
        };

        let mut resolved = asset.clone();
        resolved.download_url = outcome.object.location.clone();
        resolved.content_hash = Some(resource.content_hash.clone());
        if resource.media.is_some() {
            resolved.media = resource.media.clone();
        }
        if outcome.stream.is_some() {
            resolved.stream = outcome.stream.clone();
        }
        self.apply_asset(request_id, &resolved)?;
        let _ = self
            .tracker
            .with_request(request_id, TransferRequest::pop_upload);
        Ok(())
    }

    fn asset_context(&self, request_id: &str) -> TransferResult<AssetContext> {
        self.tracker
            .with_request(request_id, |request| AssetContext {
                key: request.key.clone(),
                published: request.published,
                indexed_assets: request.indexed_assets.clone(),
            })
            .ok_or_else(|| TransferError::UnknownRequest(request_id.to_string()))
    }

    fn apply_asset(&self, request_id: &str, asset: &Asset) -> TransferResult<()> {
        self.tracker
            .with_request(request_id, |request| {
                request.kind.model().put_asset(&mut request.document, asset);
            })
            .ok_or_else(|| TransferError::UnknownRequest(request_id.to_string()))
    }

    /// Direct-mode finalize: runs after every task joined cleanly.
    async fn finalize(&self, request_id: &str) -> TransferResult<FinalizedTransfer> {
        let request = self
            .tracker
            .complete(request_id)
            .ok_or_else(|| TransferError::UnknownRequest(request_id.to_string()))?;
        let result = self.finalize_request(request).await;
        self.fetcher.cleanup(request_id).await;
        result
    }

    /// Direct-mode abort: drops the tracker entry and staging, keeps the
    /// first error. Assets uploaded before the failure stay in storage.
    async fn abort(&self, request_id: &str, error: TransferError) -> TransferError {
        if self.tracker.complete(request_id).is_some() {
            warn!(request_id, error = %error, "transfer aborted");
        }
        self.fetcher.cleanup(request_id).await;
        error
    }

    /// Queue-mode settle: finalizes once both counters are at zero and
    /// delivers the outcome through the request's completion channel.
    async fn maybe_settle(&self, request_id: &str) {
        let settled = self
            .tracker
            .with_request(request_id, |request| request.is_settled())
            .unwrap_or(false);
        if settled {
            self.settle(request_id).await;
        }
    }

    async fn settle(&self, request_id: &str) {
        let Some(mut request) = self.tracker.complete(request_id) else {
            return;
        };
        let completion = request.completion.take();
        let result = self.finalize_request(request).await;
        self.fetcher.cleanup(request_id).await;
        if let Some(sender) = completion {
            let _ = sender.send(result);
        }
    }

    /// Queue-mode failure path; the entry leaving the tracker is what
    /// turns late messages for this request into no-ops.
    async fn fail(&self, request_id: &str, error: TransferError) {
        let Some(mut request) = self.tracker.complete(request_id) else {
            warn!(request_id, error = %error, "failure for untracked request dropped");
            return;
        };
        warn!(request_id, key = %request.key, error = %error, "transfer failed");
        let completion = request.completion.take();
        self.fetcher.cleanup(request_id).await;
        if let Some(sender) = completion {
            let _ = sender.send(Err(error));
        }
    }

    async fn finalize_request(
        &self,
        request: TransferRequest,
    ) -> TransferResult<FinalizedTransfer> {
        let model = request.kind.model();
        let current_assets = model.get_assets(&request.document);
        let orphans = orphaned_assets(&request.indexed_assets, &current_assets);

        let mut removed_locations = Vec::new();
        for orphan in &orphans {
            if orphan.has_download_url() {
                self.uploader.remove_location(&orphan.download_url).await;
                removed_locations.push(orphan.download_url.clone());
            }
            if let Some(stream) = &orphan.stream {
                self.uploader.remove_stream(&stream.uid).await;
            }
        }

        let index_id = match &request.index_id {
            Some(id) => {
                self.index
                    .update(request.kind, id, &request.document)
                    .await?
            }
            None => self.index.index(request.kind, &request.document).await?,
        };
        info!(key = %request.key, %index_id, orphans = orphans.len(), "transfer finalized");

        Ok(FinalizedTransfer {
            index_id,
            document: request.document,
            removed_locations,
        })
    }
}
