pub mod config;
pub mod document;
pub mod error;
pub mod fetch;
pub mod index;
pub mod store;
pub mod transfer;

pub use config::{load_courier_config, CourierConfig};
pub use error::{ConfigError, Result};
pub use transfer::{
    DownloadJob, FinalizedTransfer, RequestTracker, TransferCoordinator, TransferError,
    TransferQueues, TransferRequest, TransferResult, UploadJob,
};
