use block_ingest_common::{hash_prefix, BlockHash, Receipt, StoredBlock, Transaction, TxHash};
use rusqlite::{params, Connection};

use super::{Indexer, IndexerError};
use crate::store::{SqliteBlockStore, StoreError};

/// Maps the first bytes of every transaction hash to its block number.
///
/// Prefixes collide, so a lookup yields candidate blocks that the caller
/// checks with [`resolve_transaction`].
pub struct TxLookupIndexer;

/// Maps the first bytes of every block hash to the block number.
pub struct BlockHashIndexer;

impl Indexer for TxLookupIndexer {
    fn name(&self) -> &'static str {
        "tx_lookup"
    }

    fn initialize(&mut self, conn: &Connection) -> Result<(), IndexerError> {
        create_prefix_table(conn, "tx_lookup")
    }

    fn handle_block(&mut self, conn: &Connection, block: &StoredBlock) -> Result<(), IndexerError> {
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO tx_lookup (hash_prefix, block_number) VALUES (?1, ?2)",
        )?;
        for hash in block.block().transaction_hashes() {
            stmt.execute(params![hash_prefix(&hash), block.number() as i64])?;
        }
        Ok(())
    }
}

impl Indexer for BlockHashIndexer {
    fn name(&self) -> &'static str {
        "block_lookup"
    }

    fn initialize(&mut self, conn: &Connection) -> Result<(), IndexerError> {
        create_prefix_table(conn, "block_lookup")
    }

    fn handle_block(&mut self, conn: &Connection, block: &StoredBlock) -> Result<(), IndexerError> {
        conn.prepare_cached(
            "INSERT OR REPLACE INTO block_lookup (hash_prefix, block_number) VALUES (?1, ?2)",
        )?
        .execute(params![hash_prefix(&block.hash()), block.number() as i64])?;
        Ok(())
    }
}

fn create_prefix_table(conn: &Connection, table: &str) -> Result<(), IndexerError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            hash_prefix BLOB NOT NULL,
            block_number INTEGER NOT NULL,
            PRIMARY KEY (hash_prefix, block_number)
        ) WITHOUT ROWID;"
    ))?;
    Ok(())
}

fn candidates(conn: &Connection, table: &str, prefix: &[u8]) -> Result<Vec<u64>, IndexerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT block_number FROM {table} WHERE hash_prefix = ?1 ORDER BY block_number"
    ))?;
    let numbers = stmt
        .query_map([prefix], |row| row.get::<_, i64>(0))?
        .map(|n| n.map(|n| n as u64))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(numbers)
}

/// Blocks that may contain the transaction.
pub fn transaction_candidates(conn: &Connection, hash: &TxHash) -> Result<Vec<u64>, IndexerError> {
    candidates(conn, "tx_lookup", hash_prefix(hash))
}

/// Blocks whose hash may be `hash`.
pub fn block_candidates(conn: &Connection, hash: &BlockHash) -> Result<Vec<u64>, IndexerError> {
    candidates(conn, "block_lookup", hash_prefix(hash))
}

/// Picks the candidate block that really contains the transaction.
pub fn resolve_transaction<'a>(
    hash: &TxHash,
    candidates: impl IntoIterator<Item = &'a StoredBlock>,
) -> Option<(&'a StoredBlock, &'a Transaction, &'a Receipt)> {
    candidates.into_iter().find_map(|block| {
        block
            .transactions_with_receipts()
            .find(|(tx, _)| tx.hash == *hash)
            .map(|(tx, receipt)| (block, tx, receipt))
    })
}

/// Picks the candidate block whose full hash matches.
pub fn resolve_block<'a>(
    hash: &BlockHash,
    candidates: impl IntoIterator<Item = &'a StoredBlock>,
) -> Option<&'a StoredBlock> {
    candidates.into_iter().find(|block| block.hash() == *hash)
}

/// Where a transaction landed, as recorded by the node.
#[derive(Debug, Clone)]
pub struct TransactionLocation {
    pub block_number: u64,
    pub transaction: Transaction,
    pub receipt: Receipt,
}

#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    #[error(transparent)]
    Index(#[from] IndexerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves a transaction hash through the prefix index and the block store.
pub async fn lookup_transaction(
    conn: &Connection,
    store: &SqliteBlockStore,
    hash: &TxHash,
) -> Result<Option<TransactionLocation>, LookupError> {
    let numbers = transaction_candidates(conn, hash)?;
    let blocks = store.get_many(numbers).await?.found;
    Ok(
        resolve_transaction(hash, &blocks).map(|(block, tx, receipt)| TransactionLocation {
            block_number: block.number(),
            transaction: tx.clone(),
            receipt: receipt.clone(),
        }),
    )
}

/// Resolves a block hash through the prefix index and the block store.
pub async fn lookup_block(
    conn: &Connection,
    store: &SqliteBlockStore,
    hash: &BlockHash,
) -> Result<Option<StoredBlock>, LookupError> {
    let numbers = block_candidates(conn, hash)?;
    let blocks = store.get_many(numbers).await?.found;
    Ok(blocks.into_iter().find(|block| block.hash() == *hash))
}

#[cfg(test)]
mod tests {
    use block_ingest_common::{Block, B256};

    use super::*;

    fn hash(prefix: u8, tail: u8) -> B256 {
        let mut bytes = [prefix; 32];
        bytes[31] = tail;
        B256::from(bytes)
    }

    fn block(number: u64, txs: &[B256]) -> StoredBlock {
        StoredBlock::new(
            Block::new(
                number,
                hash(0xb0, number as u8),
                B256::ZERO,
                0,
                txs.iter().copied().map(Transaction::new).collect(),
            ),
            txs.iter().map(|h| Receipt::new(*h, number)),
        )
        .unwrap()
    }

    fn indexed(blocks: &[StoredBlock]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let mut txs = TxLookupIndexer;
        let mut heads = BlockHashIndexer;
        txs.initialize(&conn).unwrap();
        heads.initialize(&conn).unwrap();
        for block in blocks {
            txs.handle_block(&conn, block).unwrap();
            heads.handle_block(&conn, block).unwrap();
        }
        conn
    }

    #[test]
    fn it_discards_prefix_collisions() {
        // Same five leading bytes, different full hashes.
        let wanted = hash(0x11, 1);
        let lookalike = hash(0x11, 2);
        let blocks = vec![block(3, &[lookalike]), block(9, &[wanted])];
        let conn = indexed(&blocks);

        let numbers = transaction_candidates(&conn, &wanted).unwrap();
        assert_eq!(numbers, vec![3, 9]);

        let (found, tx, receipt) = resolve_transaction(&wanted, &blocks).unwrap();
        assert_eq!(found.number(), 9);
        assert_eq!(tx.hash, wanted);
        assert_eq!(receipt.transaction_hash, wanted);
        assert!(resolve_transaction(&hash(0x11, 3), &blocks).is_none());
    }

    #[test]
    fn it_indexes_block_hashes() {
        let blocks = vec![block(4, &[]), block(5, &[hash(0x22, 0)])];
        let conn = indexed(&blocks);

        let target = blocks[1].hash();
        let numbers = block_candidates(&conn, &target).unwrap();
        assert_eq!(numbers, vec![4, 5]);
        assert_eq!(resolve_block(&target, &blocks).map(StoredBlock::number), Some(5));
    }

    #[tokio::test]
    async fn it_looks_up_through_the_store() {
        let wanted = hash(0x55, 1);
        let blocks = vec![block(1, &[hash(0x55, 2)]), block(2, &[wanted])];
        let conn = indexed(&blocks);
        let store = SqliteBlockStore::in_memory(Default::default()).unwrap();
        store.put_many(blocks.clone()).await.unwrap();

        let location = lookup_transaction(&conn, &store, &wanted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(location.block_number, 2);
        assert_eq!(location.receipt.block_number, 2);
        assert!(lookup_transaction(&conn, &store, &hash(0x66, 0))
            .await
            .unwrap()
            .is_none());

        let found = lookup_block(&conn, &store, &blocks[0].hash()).await.unwrap();
        assert_eq!(found.map(|b| b.number()), Some(1));
    }

    #[test]
    fn it_tolerates_replayed_blocks() {
        let blocks = vec![block(7, &[hash(0x33, 0), hash(0x44, 0)])];
        let conn = indexed(&blocks);
        let mut txs = TxLookupIndexer;
        txs.handle_block(&conn, &blocks[0]).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM tx_lookup", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }
}
