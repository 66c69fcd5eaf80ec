use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::config::IndexSection;
use crate::document::{DocumentKey, DocumentKind};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("document not found for {0}")]
    NotFound(String),
    #[error("query {0} matched more than one document")]
    NotUnique(String),
    #[error("index request failed: {0}")]
    Request(String),
    #[error("unexpected index response: {0}")]
    Response(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Lookup selector: either the stable external key or the index-assigned
/// document id.
#[derive(Debug, Clone)]
pub enum IndexQuery {
    Key(DocumentKey),
    Id(String),
}

impl std::fmt::Display for IndexQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexQuery::Key(key) => write!(f, "key {key}"),
            IndexQuery::Id(id) => write!(f, "id {id}"),
        }
    }
}

/// A persisted document together with its index id.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub id: String,
    pub body: Value,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteByQueryReport {
    pub deleted: u64,
    pub failures: u64,
}

/// Search index collaborator. Invoked by the coordinator only after a
/// transfer finalizes.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn find(
        &self,
        kind: DocumentKind,
        query: &IndexQuery,
    ) -> IndexResult<Option<IndexedDocument>>;
    async fn index(&self, kind: DocumentKind, body: &Value) -> IndexResult<String>;
    async fn update(&self, kind: DocumentKind, id: &str, body: &Value) -> IndexResult<String>;
    async fn delete(&self, kind: DocumentKind, id: &str) -> IndexResult<bool>;
    async fn delete_by_query(
        &self,
        kind: DocumentKind,
        query: &IndexQuery,
    ) -> IndexResult<DeleteByQueryReport>;
}

/// Bounded retry around `find` for callers that race freshly written
/// documents against index refresh.
pub async fn find_with_retry(
    index: &dyn DocumentIndex,
    kind: DocumentKind,
    query: &IndexQuery,
    retries: u32,
    delay: Duration,
) -> IndexResult<IndexedDocument> {
    let attempts = retries.max(1);
    for attempt in 0..attempts {
        if let Some(found) = index.find(kind, query).await? {
            return Ok(found);
        }
        if attempt + 1 < attempts {
            debug!(%query, attempt = attempt + 1, "document not visible yet, retrying");
            sleep(delay).await;
        }
    }
    Err(IndexError::NotFound(query.to_string()))
}

/// Search-index REST client (Elasticsearch-style endpoints).
#[derive(Debug, Clone)]
pub struct HttpDocumentIndex {
    client: Client,
    section: IndexSection,
}

impl HttpDocumentIndex {
    pub fn new(client: Client, section: IndexSection) -> Self {
        let mut section = section;
        while section.endpoint.ends_with('/') {
            section.endpoint.pop();
        }
        Self { client, section }
    }

    fn index_name(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::Video => &self.section.video_index,
            DocumentKind::Post => &self.section.post_index,
            DocumentKind::Course => &self.section.course_index,
        }
    }

    fn url(&self, kind: DocumentKind, suffix: &str) -> String {
        format!(
            "{}/{}/{}",
            self.section.endpoint,
            self.index_name(kind),
            suffix
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> IndexResult<Value> {
        let response = request
            .send()
            .await
            .map_err(|err| IndexError::Request(err.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| IndexError::Response(err.to_string()))?;
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(IndexError::Request(format!(
                "index answered {status}: {body}"
            )));
        }
        Ok(body)
    }

    fn key_query(key: &DocumentKey) -> Value {
        json!({
            "query": {
                "bool": {
                    "must": [
                        { "term": { "site": key.site } },
                        { "term": { "post_id": key.post_id } }
                    ]
                }
            }
        })
    }
}

#[async_trait]
impl DocumentIndex for HttpDocumentIndex {
    async fn find(
        &self,
        kind: DocumentKind,
        query: &IndexQuery,
    ) -> IndexResult<Option<IndexedDocument>> {
        match query {
            IndexQuery::Id(id) => {
                let body = self
                    .send(self.client.get(self.url(kind, &format!("_doc/{id}"))))
                    .await?;
                if body.get("found").and_then(Value::as_bool) != Some(true) {
                    return Ok(None);
                }
                let source = body
                    .get("_source")
                    .cloned()
                    .ok_or_else(|| IndexError::Response("missing _source".into()))?;
                Ok(Some(IndexedDocument {
                    id: id.clone(),
                    body: source,
                }))
            }
            IndexQuery::Key(key) => {
                let body = self
                    .send(
                        self.client
                            .post(self.url(kind, "_search"))
                            .json(&Self::key_query(key)),
                    )
                    .await?;
                let hits = body
                    .pointer("/hits/hits")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                match hits.len() {
                    0 => Ok(None),
                    1 => {
                        let hit = &hits[0];
                        let id = hit
                            .get("_id")
                            .and_then(Value::as_str)
                            .ok_or_else(|| IndexError::Response("missing _id".into()))?
                            .to_string();
                        let source = hit
                            .get("_source")
                            .cloned()
                            .ok_or_else(|| IndexError::Response("missing _source".into()))?;
                        Ok(Some(IndexedDocument { id, body: source }))
                    }
                    _ => Err(IndexError::NotUnique(query.to_string())),
                }
            }
        }
    }

    async fn index(&self, kind: DocumentKind, body: &Value) -> IndexResult<String> {
        let response = self
            .send(self.client.post(self.url(kind, "_doc")).json(body))
            .await?;
        response
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IndexError::Response("document was not created".into()))
    }

    async fn update(&self, kind: DocumentKind, id: &str, body: &Value) -> IndexResult<String> {
        let response = self
            .send(
                self.client
                    .post(self.url(kind, &format!("_update/{id}")))
                    .json(&json!({ "doc": body })),
            )
            .await?;
        response
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IndexError::Response("document was not updated".into()))
    }

    async fn delete(&self, kind: DocumentKind, id: &str) -> IndexResult<bool> {
        let response = self
            .send(self.client.delete(self.url(kind, &format!("_doc/{id}"))))
            .await?;
        Ok(response.get("result").and_then(Value::as_str) == Some("deleted"))
    }

    async fn delete_by_query(
        &self,
        kind: DocumentKind,
        query: &IndexQuery,
    ) -> IndexResult<DeleteByQueryReport> {
        let payload = match query {
            IndexQuery::Key(key) => Self::key_query(key),
            IndexQuery::Id(id) => json!({ "query": { "term": { "_id": id } } }),
        };
        let response = self
            .send(
                self.client
                    .post(self.url(kind, "_delete_by_query"))
                    .json(&payload),
            )
            .await?;
        Ok(DeleteByQueryReport {
            deleted: response.get("deleted").and_then(Value::as_u64).unwrap_or(0),
            failures: response
                .get("failures")
                .and_then(Value::as_array)
                .map(|failures| failures.len() as u64)
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FlakyIndex {
        misses_before_hit: AtomicU32,
        document: Mutex<Option<IndexedDocument>>,
    }

    #[async_trait]
    impl DocumentIndex for FlakyIndex {
        async fn find(
            &self,
            _kind: DocumentKind,
            _query: &IndexQuery,
        ) -> IndexResult<Option<IndexedDocument>> {
            let remaining = self.misses_before_hit.load(Ordering::SeqCst);
            if remaining > 0 {
                self.misses_before_hit.store(remaining - 1, Ordering::SeqCst);
                return Ok(None);
            }
            Ok(self.document.lock().unwrap().clone())
        }

        async fn index(&self, _kind: DocumentKind, _body: &Value) -> IndexResult<String> {
            unimplemented!()
        }

        async fn update(
            &self,
            _kind: DocumentKind,
            _id: &str,
            _body: &Value,
        ) -> IndexResult<String> {
            unimplemented!()
        }

        async fn delete(&self, _kind: DocumentKind, _id: &str) -> IndexResult<bool> {
            unimplemented!()
        }

        async fn delete_by_query(
            &self,
            _kind: DocumentKind,
            _query: &IndexQuery,
        ) -> IndexResult<DeleteByQueryReport> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn find_with_retry_survives_refresh_lag() {
        let index = FlakyIndex {
            misses_before_hit: AtomicU32::new(2),
            document: Mutex::new(Some(IndexedDocument {
                id: "es-1".into(),
                body: json!({ "site": "publisher", "post_id": 42 }),
            })),
        };
        let query = IndexQuery::Key(DocumentKey::new("publisher", 42));
        let found = find_with_retry(
            &index,
            DocumentKind::Video,
            &query,
            5,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(found.id, "es-1");
    }

    #[tokio::test]
    async fn find_with_retry_gives_up() {
        let index = FlakyIndex {
            misses_before_hit: AtomicU32::new(100),
            document: Mutex::new(None),
        };
        let query = IndexQuery::Id("missing".into());
        let err = find_with_retry(
            &index,
            DocumentKind::Post,
            &query,
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
    }
}
