use thiserror::Error;

use crate::document::DocumentKey;
use crate::fetch::FetchError;
use crate::index::IndexError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("a transfer for {0} is already in flight")]
    Collision(DocumentKey),
    #[error("document is missing its (site, post_id) key")]
    MissingKey,
    #[error("transfer request {0} is not tracked")]
    UnknownRequest(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

pub type TransferResult<T> = Result<T, TransferError>;
