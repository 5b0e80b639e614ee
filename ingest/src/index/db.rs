use std::path::Path;
use std::time::Duration;

use block_ingest_common::StoredBlock;
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use super::checkpoint::{self, Checkpoint};
use super::{IndexerError, Indexers};
use crate::store::configure_connection;
use crate::window::BlockWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Owns the checkpoint and the indexer tables.
    Writer,
    /// Opened read-only; used by status and lookup tooling.
    Reader,
}

/// The database holding the checkpoint and every indexer's tables.
pub struct IndexDb {
    conn: Connection,
    mode: AccessMode,
}

impl IndexDb {
    pub fn open_writer(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Self::writer(conn)
    }

    pub fn in_memory() -> Result<Self, IndexerError> {
        Self::writer(Connection::open_in_memory()?)
    }

    fn writer(conn: Connection) -> Result<Self, IndexerError> {
        checkpoint::create_table(&conn)?;
        Ok(Self {
            conn,
            mode: AccessMode::Writer,
        })
    }

    pub fn open_reader(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            mode: AccessMode::Reader,
        })
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn checkpoint(&self) -> Result<Checkpoint, IndexerError> {
        checkpoint::load(&self.conn)
    }

    pub fn record_heartbeat(&self, timestamp: u64) -> Result<(), IndexerError> {
        if self.mode == AccessMode::Reader {
            return Err(IndexerError::ReadOnly);
        }
        checkpoint::store_heartbeat(&self.conn, timestamp)
    }

    /// Applies `blocks` to every indexer and advances the checkpoint to the end
    /// of `window`, all in one transaction. Nothing is written if any indexer
    /// fails.
    pub fn commit_window(
        &mut self,
        indexers: &mut Indexers,
        window: BlockWindow,
        blocks: &[StoredBlock],
        latest_block_number: u64,
    ) -> Result<(), IndexerError> {
        if self.mode == AccessMode::Reader {
            return Err(IndexerError::ReadOnly);
        }

        let tx = self.conn.transaction()?;
        for block in blocks {
            indexers.handle_block(&tx, block)?;
        }
        checkpoint::store_progress(&tx, window.end, latest_block_number)?;
        tx.commit()?;

        debug!(%window, blocks = blocks.len(), "committed window");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use block_ingest_common::{Block, Receipt, Transaction, B256};

    use super::*;
    use crate::index::Indexer;

    struct Recorder;

    impl Indexer for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn initialize(&mut self, conn: &Connection) -> Result<(), IndexerError> {
            conn.execute_batch("CREATE TABLE IF NOT EXISTS seen (n INTEGER PRIMARY KEY)")?;
            Ok(())
        }

        fn handle_block(&mut self, conn: &Connection, block: &StoredBlock) -> Result<(), IndexerError> {
            conn.execute("INSERT INTO seen (n) VALUES (?1)", [block.number() as i64])?;
            Ok(())
        }
    }

    fn block(number: u64) -> StoredBlock {
        let tx = B256::with_last_byte(number as u8);
        StoredBlock::new(
            Block::new(number, tx, B256::ZERO, 0, vec![Transaction::new(tx)]),
            [Receipt::new(tx, number)],
        )
        .unwrap()
    }

    fn seen(db: &IndexDb) -> i64 {
        db.conn()
            .query_row("SELECT COUNT(*) FROM seen", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn it_commits_blocks_and_checkpoint_together() {
        let mut db = IndexDb::in_memory().unwrap();
        let mut indexers = Indexers::new(vec![Box::new(Recorder)]);
        indexers.initialize(&db).unwrap();

        let window = BlockWindow { start: 0, end: 2 };
        db.commit_window(&mut indexers, window, &[block(0), block(1), block(2)], 10)
            .unwrap();

        assert_eq!(seen(&db), 3);
        let checkpoint = db.checkpoint().unwrap();
        assert_eq!(checkpoint.last_processed_block, Some(2));
        assert_eq!(checkpoint.latest_block_number, 10);
    }

    #[test]
    fn it_rolls_back_everything_on_failure() {
        let mut db = IndexDb::in_memory().unwrap();
        let mut indexers = Indexers::new(vec![Box::new(Recorder)]);
        indexers.initialize(&db).unwrap();

        // The plain INSERT fails on the duplicate block.
        let window = BlockWindow { start: 0, end: 1 };
        let err = db
            .commit_window(&mut indexers, window, &[block(0), block(1), block(1)], 5)
            .unwrap_err();
        assert!(matches!(
            err,
            IndexerError::Block {
                indexer: "recorder",
                block_number: 1,
                ..
            }
        ));
        assert_eq!(seen(&db), 0);
        assert_eq!(db.checkpoint().unwrap().last_processed_block, None);
    }

    #[test]
    fn it_refuses_to_initialize_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let _writer = IndexDb::open_writer(&path).unwrap();

        let reader = IndexDb::open_reader(&path).unwrap();
        let mut indexers = Indexers::new(vec![Box::new(Recorder)]);
        assert!(matches!(
            indexers.initialize(&reader),
            Err(IndexerError::ReadOnly)
        ));
        assert!(matches!(
            reader.record_heartbeat(1),
            Err(IndexerError::ReadOnly)
        ));
        assert_eq!(reader.checkpoint().unwrap().last_processed_block, None);
    }
}
