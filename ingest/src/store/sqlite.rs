use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use block_ingest_common::StoredBlock;
use itertools::Itertools as _;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use tracing::{debug, warn};

use super::{decode_block, encode_block, StoreError};

/// SQLite limits the number of bound parameters per statement.
const MAX_PARAMS_PER_QUERY: usize = 500;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS blocks (
    block_number INTEGER PRIMARY KEY,
    data BLOB NOT NULL
)";

/// Standard pragmas for every connection opened by this crate.
pub fn configure_connection(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA temp_store=MEMORY;
         PRAGMA cache_size=-65536;",
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStoreConfig {
    /// zstd level used for stored blocks.
    pub compression_level: i32,
    /// Buffered blocks that trigger a write to disk.
    pub flush_threshold: usize,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
            flush_threshold: 1000,
        }
    }
}

/// Result of a multi-block read.
#[derive(Debug, Default)]
pub struct BlockLookup {
    pub found: Vec<StoredBlock>,
    /// Requested numbers that are not stored, in request order.
    pub missing: Vec<u64>,
}

/// Random-access block cache in one SQLite table of zstd-compressed JSON
/// records.
///
/// Writes are buffered in memory and written in one transaction once the
/// buffer reaches the flush threshold, on [`flush`](Self::flush) and on
/// [`close`](Self::close). Reads see buffered writes.
#[derive(Clone)]
pub struct SqliteBlockStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    pending: Mutex<BTreeMap<u64, Vec<u8>>>,
    closed: AtomicBool,
    config: BlockStoreConfig,
}

impl SqliteBlockStore {
    pub fn open(path: impl AsRef<Path>, config: BlockStoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Self::with_connection(conn, config)
    }

    pub fn in_memory(config: BlockStoreConfig) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: BlockStoreConfig) -> Result<Self, StoreError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                pending: Mutex::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    pub async fn get(&self, number: u64) -> Result<Option<StoredBlock>, StoreError> {
        Ok(self.get_many(vec![number]).await?.found.pop())
    }

    pub async fn get_many(&self, numbers: Vec<u64>) -> Result<BlockLookup, StoreError> {
        self.blocking(move |inner| inner.get_many(&numbers)).await
    }

    /// Stores a block, replacing any previous record for its number.
    pub async fn put(&self, block: StoredBlock) -> Result<(), StoreError> {
        self.put_many(vec![block]).await
    }

    pub async fn put_many(&self, blocks: Vec<StoredBlock>) -> Result<(), StoreError> {
        self.blocking(move |inner| inner.put_many(&blocks)).await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.blocking(|inner| inner.flush()).await
    }

    /// Flushes buffered writes; afterwards every operation fails with
    /// [`StoreError::Closed`].
    pub async fn close(&self) -> Result<(), StoreError> {
        self.flush().await?;
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.conn.lock().execute_batch("PRAGMA optimize;") {
            debug!("block store optimize failed: {e}");
        }
        Ok(())
    }

    /// Number of blocks on disk, not counting buffered writes.
    pub async fn stored_count(&self) -> Result<u64, StoreError> {
        self.blocking(|inner| {
            let count: i64 =
                inner
                    .conn
                    .lock()
                    .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Inner) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl Inner {
    fn get_many(&self, numbers: &[u64]) -> Result<BlockLookup, StoreError> {
        let mut raw = BTreeMap::new();
        {
            let pending = self.pending.lock();
            for number in numbers {
                if let Some(data) = pending.get(number) {
                    raw.insert(*number, data.clone());
                }
            }
        }

        let unbuffered = numbers
            .iter()
            .filter(|n| !raw.contains_key(*n))
            .map(|n| *n as i64)
            .unique()
            .collect::<Vec<_>>();
        {
            let conn = self.conn.lock();
            for chunk in unbuffered.chunks(MAX_PARAMS_PER_QUERY) {
                let sql = format!(
                    "SELECT block_number, data FROM blocks WHERE block_number IN ({})",
                    std::iter::repeat("?").take(chunk.len()).join(",")
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
                while let Some(row) = rows.next()? {
                    let number: i64 = row.get(0)?;
                    raw.insert(number as u64, row.get::<_, Vec<u8>>(1)?);
                }
            }
        }

        let mut lookup = BlockLookup::default();
        let mut corrupted = Vec::new();
        for (number, data) in raw {
            match decode_block(&data) {
                Ok(block) if block.number() == number => lookup.found.push(block),
                Ok(block) => {
                    warn!(
                        block_number = number,
                        "stored record holds block {}, discarding it",
                        block.number()
                    );
                    corrupted.push(number);
                }
                Err(e) => {
                    warn!(block_number = number, "discarding corrupted stored block: {e}");
                    corrupted.push(number);
                }
            }
        }
        if !corrupted.is_empty() {
            self.delete(&corrupted)?;
        }

        let found = lookup
            .found
            .iter()
            .map(StoredBlock::number)
            .collect::<HashSet<_>>();
        lookup.missing = numbers
            .iter()
            .copied()
            .filter(|n| !found.contains(n))
            .unique()
            .collect();
        Ok(lookup)
    }

    fn put_many(&self, blocks: &[StoredBlock]) -> Result<(), StoreError> {
        let encoded = blocks
            .iter()
            .map(|block| {
                encode_block(block, self.config.compression_level).map(|data| (block.number(), data))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let buffered = {
            let mut pending = self.pending.lock();
            pending.extend(encoded);
            pending.len()
        };
        if buffered >= self.config.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        // Holding the connection while the buffer is swapped out keeps readers
        // from missing records that are in neither place.
        let mut conn = self.conn.lock();
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO blocks (block_number, data) VALUES (?1, ?2)",
            )?;
            for (number, data) in &batch {
                stmt.execute(params![*number as i64, data])?;
            }
        }
        tx.commit()?;
        debug!(blocks = batch.len(), "flushed block store");
        Ok(())
    }

    fn delete(&self, numbers: &[u64]) -> Result<(), StoreError> {
        {
            let mut pending = self.pending.lock();
            for number in numbers {
                pending.remove(number);
            }
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("DELETE FROM blocks WHERE block_number = ?1")?;
        for number in numbers {
            stmt.execute([*number as i64])?;
        }
        Ok(())
    }
}
