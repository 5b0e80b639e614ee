use thiserror::Error;

use crate::archive::ArchiveError;
use crate::fetcher::FetchError;
use crate::index::IndexerError;
use crate::rpc::RpcError;
use crate::sink::SinkError;
use crate::store::StoreError;
use crate::window::BlockWindow;

/// Everything that can stop an ingestion cycle.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("block store: {0}")]
    Store(#[from] StoreError),
    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error("sink: {0}")]
    Sink(#[from] SinkError),
    #[error("blocks {missing:?} of window {window} are not available")]
    IncompleteWindow {
        window: BlockWindow,
        missing: Vec<u64>,
    },
}

impl IngestError {
    /// Transient failures are retried by the loops after a backoff. Integrity
    /// and storage failures stop the process.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Rpc(e) => !e.is_integrity(),
            IngestError::Fetch(e) => e.is_retryable(),
            IngestError::IncompleteWindow { .. } => true,
            IngestError::Sink(e) => e.is_retryable(),
            IngestError::Store(_) | IngestError::Archive(_) | IngestError::Indexer(_) => false,
        }
    }
}
