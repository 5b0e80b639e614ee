use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::Serialize;

use super::{IndexDb, IndexerError};

const LAST_PROCESSED_BLOCK: &str = "last_processed_block";
const LATEST_BLOCK_NUMBER: &str = "latest_block_number";
const LAST_UPDATED_TIMESTAMP: &str = "last_updated_timestamp";

/// An indexer whose heartbeat is older than this many seconds is unhealthy.
pub const HEALTHY_WITHIN: u64 = 60;
/// Lag, in blocks, under which an indexer counts as caught up.
pub const CAUGHT_UP_THRESHOLD: u64 = 3;

/// Persisted ingestion progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    /// `None` until the first window commits; stored as `-1`.
    pub last_processed_block: Option<u64>,
    pub latest_block_number: u64,
    /// Unix seconds of the last heartbeat.
    pub last_updated_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub last_processed_block: i64,
    pub latest_block_number: u64,
    pub last_updated_timestamp: u64,
    pub healthy: bool,
    pub caught_up: bool,
}

impl Checkpoint {
    pub fn status(&self, now: u64) -> Status {
        let processed = self.last_processed_block.map_or(-1, |n| n as i64);
        Status {
            last_processed_block: processed,
            latest_block_number: self.latest_block_number,
            last_updated_timestamp: self.last_updated_timestamp,
            healthy: now.saturating_sub(self.last_updated_timestamp) < HEALTHY_WITHIN,
            caught_up: (self.latest_block_number as i64 - processed) < CAUGHT_UP_THRESHOLD as i64,
        }
    }
}

pub(crate) fn create_table(conn: &Connection) -> Result<(), IndexerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS configs (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO configs (key, value) VALUES (?1, ?2)")?;
    for (key, default) in [
        (LAST_PROCESSED_BLOCK, "-1"),
        (LATEST_BLOCK_NUMBER, "0"),
        (LAST_UPDATED_TIMESTAMP, "0"),
    ] {
        stmt.execute(params![key, default])?;
    }
    Ok(())
}

pub(crate) fn load(conn: &Connection) -> Result<Checkpoint, IndexerError> {
    let last_processed = read_int(conn, LAST_PROCESSED_BLOCK, -1)?;
    Ok(Checkpoint {
        last_processed_block: u64::try_from(last_processed).ok(),
        latest_block_number: read_int(conn, LATEST_BLOCK_NUMBER, 0)?.max(0) as u64,
        last_updated_timestamp: read_int(conn, LAST_UPDATED_TIMESTAMP, 0)?.max(0) as u64,
    })
}

pub(crate) fn store_progress(
    conn: &Connection,
    last_processed_block: u64,
    latest_block_number: u64,
) -> Result<(), IndexerError> {
    write(conn, LAST_PROCESSED_BLOCK, last_processed_block as i64)?;
    write(conn, LATEST_BLOCK_NUMBER, latest_block_number as i64)
}

pub(crate) fn store_heartbeat(conn: &Connection, timestamp: u64) -> Result<(), IndexerError> {
    write(conn, LAST_UPDATED_TIMESTAMP, timestamp as i64)
}

fn read_int(conn: &Connection, key: &'static str, default: i64) -> Result<i64, IndexerError> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM configs WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    match value {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| IndexerError::BadConfigValue { key, value }),
    }
}

fn write(conn: &Connection, key: &str, value: i64) -> Result<(), IndexerError> {
    conn.execute(
        "INSERT OR REPLACE INTO configs (key, value) VALUES (?1, ?2)",
        params![key, value.to_string()],
    )?;
    Ok(())
}

/// Read-only view of the checkpoint for status reporting. It never writes and
/// can run next to a live writer.
pub struct CheckpointReader {
    db: IndexDb,
}

impl CheckpointReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        Ok(Self {
            db: IndexDb::open_reader(path)?,
        })
    }

    pub fn checkpoint(&self) -> Result<Checkpoint, IndexerError> {
        self.db.checkpoint()
    }

    pub fn status(&self, now: u64) -> Result<Status, IndexerError> {
        Ok(self.checkpoint()?.status(now))
    }
}
