use std::num::NonZeroUsize;
use std::sync::Arc;

use block_ingest_common::{BlockHash, StoredBlock};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::IngestError;
use crate::fetcher::BlockFetcher;
use crate::rpc::RpcTransport;
use crate::store::SqliteBlockStore;

const CACHE_SIZE: usize = 256;

/// Cache-aside access to blocks: memory, then the block store, then the node.
///
/// Blocks fetched from the node are written back to the store before they are
/// returned.
pub struct CachedBlockSource<T> {
    fetcher: BlockFetcher<T>,
    store: SqliteBlockStore,
    blocks_by_number: Mutex<lru::LruCache<u64, StoredBlock>>,
    blocks_by_hash: Mutex<lru::LruCache<BlockHash, u64>>,
}

impl<T: RpcTransport> CachedBlockSource<T> {
    pub fn new(fetcher: BlockFetcher<T>, store: SqliteBlockStore) -> Self {
        let size = NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            fetcher,
            store,
            blocks_by_number: Mutex::new(lru::LruCache::new(size)),
            blocks_by_hash: Mutex::new(lru::LruCache::new(size)),
        }
    }

    pub fn fetcher(&self) -> &BlockFetcher<T> {
        &self.fetcher
    }

    pub fn store(&self) -> &SqliteBlockStore {
        &self.store
    }

    /// Returns the requested blocks that exist, sorted by number and without
    /// duplicates. Numbers the node does not have yet are simply absent.
    pub async fn get_blocks(&self, numbers: &[u64]) -> Result<Vec<StoredBlock>, IngestError> {
        let mut blocks = Vec::with_capacity(numbers.len());
        let mut uncached = Vec::new();
        {
            let mut cache = self.blocks_by_number.lock();
            for number in numbers {
                match cache.get(number) {
                    Some(block) => blocks.push(block.clone()),
                    None => uncached.push(*number),
                }
            }
        }

        if !uncached.is_empty() {
            let lookup = self.store.get_many(uncached).await?;
            blocks.extend(lookup.found);

            if !lookup.missing.is_empty() {
                debug!(
                    missing = lookup.missing.len(),
                    first = lookup.missing.first().copied().unwrap_or_default(),
                    "fetching blocks missing from the store"
                );
                let fetched = self.fetcher.fetch_range(&lookup.missing).await?;
                self.store.put_many(fetched.clone()).await?;
                blocks.extend(fetched);
            }
        }

        blocks.sort_by_key(StoredBlock::number);
        blocks.dedup_by_key(|block| block.number());
        self.remember(&blocks);
        Ok(blocks)
    }

    /// Looks a block up by hash among recently served blocks.
    pub async fn block_by_hash(&self, hash: BlockHash) -> Result<Option<StoredBlock>, IngestError> {
        let number = self.blocks_by_hash.lock().get(&hash).copied();
        let Some(number) = number else {
            return Ok(None);
        };
        Ok(self
            .get_blocks(&[number])
            .await?
            .into_iter()
            .find(|block| block.hash() == hash))
    }

    fn remember(&self, blocks: &[StoredBlock]) {
        let mut by_number = self.blocks_by_number.lock();
        let mut by_hash = self.blocks_by_hash.lock();
        for block in blocks {
            by_number.put(block.number(), block.clone());
            by_hash.put(block.hash(), block.number());
        }
    }
}
