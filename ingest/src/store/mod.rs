//! Durable block caches keyed by block number.

mod codec;
mod sqlite;

use thiserror::Error;

pub use codec::{decode_block, encode_block, CodecError};
pub use sqlite::{configure_connection, BlockLookup, BlockStoreConfig, SqliteBlockStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not encode block: {0}")]
    Codec(#[from] CodecError),
    #[error("block store is closed")]
    Closed,
    #[error("block store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
