use std::path::{Path, PathBuf};

use block_ingest_common::StoredBlock;
use futures::future::BoxFuture;
use futures::FutureExt as _;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt as _;

use super::{Destination, SinkError};

type Encoder = Box<dyn Fn(&StoredBlock) -> Vec<Value> + Send + Sync>;

/// Appends rows to `<name>.jsonl` and records progress in `<name>.cursor`.
///
/// Rows are appended before the cursor moves, so a crash in between repeats
/// rows on the next run; downstream loaders deduplicate by key.
pub struct JsonLinesDestination {
    name: String,
    rows_path: PathBuf,
    cursor_path: PathBuf,
    encoder: Encoder,
}

impl JsonLinesDestination {
    pub fn new(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        encoder: impl Fn(&StoredBlock) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        let dir = dir.as_ref();
        Self {
            rows_path: dir.join(format!("{name}.jsonl")),
            cursor_path: dir.join(format!("{name}.cursor")),
            name,
            encoder: Box::new(encoder),
        }
    }

    /// One row per block.
    pub fn blocks(dir: impl AsRef<Path>) -> Self {
        Self::new(dir, "blocks", |stored| {
            let block = stored.block();
            vec![json!({
                "number": block.number,
                "hash": block.hash,
                "parentHash": block.parent_hash,
                "timestamp": block.timestamp,
                "transactionCount": block.transactions.len(),
            })]
        })
    }

    /// One row per transaction.
    pub fn transactions(dir: impl AsRef<Path>) -> Self {
        Self::new(dir, "transactions", |stored| {
            stored
                .transactions_with_receipts()
                .enumerate()
                .map(|(index, (tx, receipt))| {
                    json!({
                        "hash": tx.hash,
                        "blockNumber": stored.number(),
                        "index": index,
                        "succeeded": receipt.succeeded(),
                    })
                })
                .collect()
        })
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            destination: self.name.clone(),
            source,
        }
    }

    async fn read_cursor(&self) -> Result<Option<u64>, SinkError> {
        let value = match tokio::fs::read_to_string(&self.cursor_path).await {
            Ok(value) => value,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SinkError::BadCursor {
                destination: self.name.clone(),
                value,
            })
    }

    async fn append(&self, rows: Vec<Value>, through_block: u64) -> Result<(), SinkError> {
        if let Some(parent) = self.rows_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let mut buf = Vec::new();
        for row in &rows {
            serde_json::to_writer(&mut buf, row).map_err(|e| SinkError::Encode {
                destination: self.name.clone(),
                block_number: through_block,
                message: e.to_string(),
            })?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::File::options()
            .create(true)
            .append(true)
            .open(&self.rows_path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&buf).await.map_err(|e| self.io_error(e))?;
        file.sync_data().await.map_err(|e| self.io_error(e))?;

        let staged = self.cursor_path.with_extension("cursor.tmp");
        tokio::fs::write(&staged, through_block.to_string())
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&staged, &self.cursor_path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

impl Destination for JsonLinesDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn committed_block(&mut self) -> BoxFuture<'_, Result<Option<u64>, SinkError>> {
        self.read_cursor().boxed()
    }

    fn encode(&self, block: &StoredBlock) -> Result<Vec<Value>, SinkError> {
        Ok((self.encoder)(block))
    }

    fn write(&mut self, rows: Vec<Value>, through_block: u64) -> BoxFuture<'_, Result<(), SinkError>> {
        self.append(rows, through_block).boxed()
    }
}
