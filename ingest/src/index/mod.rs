//! Indexers and the transactional database they share with the checkpoint.
//!
//! Every processed window is applied in one SQLite transaction: each block,
//! in ascending order, goes through every registered [`Indexer`] in
//! registration order, then the checkpoint advances. A crash before commit
//! leaves both untouched, so the window is replayed and indexers must write
//! with upsert semantics.

mod checkpoint;
mod db;
mod lookup;
mod tx_count;

use block_ingest_common::StoredBlock;
use rusqlite::Connection;
use thiserror::Error;

pub use checkpoint::{Checkpoint, CheckpointReader, Status, CAUGHT_UP_THRESHOLD, HEALTHY_WITHIN};
pub use db::{AccessMode, IndexDb};
pub use lookup::{
    block_candidates, lookup_block, lookup_transaction, resolve_block, resolve_transaction,
    transaction_candidates, BlockHashIndexer, LookupError, TransactionLocation, TxLookupIndexer,
};
pub use tx_count::{total_transactions, TxCountIndexer};

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("indexer `{indexer}` failed on block {block_number}: {source}")]
    Block {
        indexer: &'static str,
        block_number: u64,
        source: Box<IndexerError>,
    },
    #[error("indexers cannot be initialized on a read-only database")]
    ReadOnly,
    #[error("config `{key}` holds {value:?}, expected an integer")]
    BadConfigValue { key: &'static str, value: String },
    #[error("index task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A consumer of blocks that owns its own tables in the index database.
///
/// `handle_block` runs inside the window transaction and may see the same
/// block again after a crash; writes must be idempotent.
pub trait Indexer: Send {
    fn name(&self) -> &'static str;

    /// Creates the indexer's tables. Only ever called in writer mode.
    fn initialize(&mut self, conn: &Connection) -> Result<(), IndexerError>;

    fn handle_block(&mut self, conn: &Connection, block: &StoredBlock) -> Result<(), IndexerError>;
}

/// The fixed, ordered set of indexers a loop feeds. Built once at startup.
pub struct Indexers {
    indexers: Vec<Box<dyn Indexer>>,
}

impl Indexers {
    pub fn new(indexers: Vec<Box<dyn Indexer>>) -> Self {
        Self { indexers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.indexers.iter().map(|ix| ix.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.indexers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexers.is_empty()
    }

    pub fn initialize(&mut self, db: &IndexDb) -> Result<(), IndexerError> {
        if db.mode() == AccessMode::Reader {
            return Err(IndexerError::ReadOnly);
        }
        for indexer in &mut self.indexers {
            indexer.initialize(db.conn())?;
        }
        Ok(())
    }

    pub(crate) fn handle_block(
        &mut self,
        conn: &Connection,
        block: &StoredBlock,
    ) -> Result<(), IndexerError> {
        for indexer in &mut self.indexers {
            indexer
                .handle_block(conn, block)
                .map_err(|e| IndexerError::Block {
                    indexer: indexer.name(),
                    block_number: block.number(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }
}

/// The indexers shipped with this crate, in their registration order.
pub fn default_indexers() -> Indexers {
    Indexers::new(vec![
        Box::new(BlockHashIndexer),
        Box::new(TxLookupIndexer),
        Box::new(TxCountIndexer),
    ])
}
