use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::document::{Asset, DocumentKey, DocumentKind};

use super::error::{TransferError, TransferResult};
use super::FinalizedTransfer;

/// One in-flight document mutation: the working copy of the document, the
/// previously indexed assets, and the pending-transfer counters that gate
/// finalize.
pub struct TransferRequest {
    pub request_id: String,
    pub key: DocumentKey,
    pub kind: DocumentKind,
    pub document: Value,
    pub index_id: Option<String>,
    pub indexed_assets: Vec<Asset>,
    pub published: Option<DateTime<Utc>>,
    pub pending_downloads: u32,
    pub pending_uploads: u32,
    pub completion: Option<oneshot::Sender<TransferResult<FinalizedTransfer>>>,
}

impl TransferRequest {
    pub fn push_download(&mut self) {
        self.pending_downloads += 1;
    }

    pub fn pop_download(&mut self) {
        self.pending_downloads = self.pending_downloads.saturating_sub(1);
    }

    pub fn push_upload(&mut self) {
        self.pending_uploads += 1;
    }

    pub fn pop_upload(&mut self) {
        self.pending_uploads = self.pending_uploads.saturating_sub(1);
    }

    /// True once every dispatched download and upload has reported back.
    pub fn is_settled(&self) -> bool {
        self.pending_downloads == 0 && self.pending_uploads == 0
    }
}

/// Registry of in-flight transfers, keyed by request id. The only shared
/// mutable state between concurrent transfers; every access holds the one
/// lock, which also makes the collision check atomic with registration.
#[derive(Clone, Default)]
pub struct RequestTracker {
    inner: Arc<Mutex<HashMap<String, TransferRequest>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, TransferRequest>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admits a request unless another transfer holds the same document
    /// key. Entries leave the map exactly once, through
    /// [`RequestTracker::complete`].
    pub fn register(&self, request: TransferRequest) -> TransferResult<()> {
        let mut entries = self.entries();
        if entries
            .values()
            .any(|entry| entry.key == request.key)
        {
            return Err(TransferError::Collision(request.key.clone()));
        }
        if entries.contains_key(&request.request_id) {
            return Err(TransferError::Aborted(format!(
                "request id {} already registered",
                request.request_id
            )));
        }
        entries.insert(request.request_id.clone(), request);
        Ok(())
    }

    pub fn find_by_key(&self, key: &DocumentKey) -> Option<String> {
        self.entries()
            .values()
            .find(|entry| &entry.key == key)
            .map(|entry| entry.request_id.clone())
    }

    /// Runs `f` against a live entry under the lock. `None` when the
    /// request already completed, which callers treat as a stale message.
    pub fn with_request<R>(
        &self,
        request_id: &str,
        f: impl FnOnce(&mut TransferRequest) -> R,
    ) -> Option<R> {
        self.entries().get_mut(request_id).map(f)
    }

    /// Removes the entry. The first caller gets it; later callers get
    /// `None`, which is what makes finalize at-most-once.
    pub fn complete(&self, request_id: &str) -> Option<TransferRequest> {
        self.entries().remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, site: &str, post_id: i64) -> TransferRequest {
        TransferRequest {
            request_id: id.to_string(),
            key: DocumentKey::new(site, post_id),
            kind: DocumentKind::Video,
            document: json!({ "site": site, "post_id": post_id }),
            index_id: None,
            indexed_assets: Vec::new(),
            published: None,
            pending_downloads: 0,
            pending_uploads: 0,
            completion: None,
        }
    }

    #[test]
    fn same_key_collides_until_completed() {
        let tracker = RequestTracker::new();
        tracker.register(request("r1", "publisher", 42)).unwrap();
        let err = tracker
            .register(request("r2", "publisher", 42))
            .unwrap_err();
        assert!(matches!(err, TransferError::Collision(_)));

        // a different key is fine
        tracker.register(request("r3", "publisher", 43)).unwrap();

        assert!(tracker.complete("r1").is_some());
        tracker.register(request("r4", "publisher", 42)).unwrap();
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn complete_is_at_most_once() {
        let tracker = RequestTracker::new();
        tracker.register(request("r1", "publisher", 1)).unwrap();
        assert!(tracker.complete("r1").is_some());
        assert!(tracker.complete("r1").is_none());
    }

    #[test]
    fn counters_never_underflow() {
        let mut req = request("r1", "publisher", 1);
        req.push_download();
        req.pop_download();
        req.pop_download();
        assert_eq!(req.pending_downloads, 0);
        assert!(req.is_settled());
    }

    #[test]
    fn find_by_key_scans_live_entries() {
        let tracker = RequestTracker::new();
        tracker.register(request("r1", "publisher", 7)).unwrap();
        assert_eq!(
            tracker.find_by_key(&DocumentKey::new("publisher", 7)),
            Some("r1".to_string())
        );
        assert_eq!(tracker.find_by_key(&DocumentKey::new("publisher", 8)), None);
    }
}
