use block_ingest_common::StoredBlock;
use rusqlite::{params, Connection};

use super::{Indexer, IndexerError};

/// Keeps the number of transactions of every block.
pub struct TxCountIndexer;

impl Indexer for TxCountIndexer {
    fn name(&self) -> &'static str {
        "tx_count"
    }

    fn initialize(&mut self, conn: &Connection) -> Result<(), IndexerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tx_counts (
                block_number INTEGER PRIMARY KEY,
                block_timestamp INTEGER NOT NULL,
                tx_count INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn handle_block(&mut self, conn: &Connection, block: &StoredBlock) -> Result<(), IndexerError> {
        conn.prepare_cached(
            "INSERT OR REPLACE INTO tx_counts (block_number, block_timestamp, tx_count)
             VALUES (?1, ?2, ?3)",
        )?
        .execute(params![
            block.number() as i64,
            block.block().timestamp as i64,
            block.block().transactions.len() as i64
        ])?;
        Ok(())
    }
}

/// Transactions across every indexed block.
pub fn total_transactions(conn: &Connection) -> Result<u64, IndexerError> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(tx_count), 0) FROM tx_counts",
        [],
        |row| row.get(0),
    )?;
    Ok(total as u64)
}
