//! Export of archived blocks to destinations that are slower than the reader.
//!
//! Rows are buffered per destination. Once the total reaches the high
//! watermark the reader stops and buffers are written out until the total is
//! back at the low watermark. Every destination remembers the last block it
//! committed, so a restart resumes from the slowest one and destinations that
//! are ahead skip what they already have.

mod jsonl;
mod pipeline;

use block_ingest_common::StoredBlock;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::archive::ArchiveError;

pub use jsonl::JsonLinesDestination;
pub use pipeline::SinkPipeline;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("low watermark {low} must be below high watermark {high}")]
    InvalidWatermarks { high: usize, low: usize },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("destination `{destination}`: {source}")]
    Io {
        destination: String,
        source: std::io::Error,
    },
    #[error("destination `{destination}` could not encode block {block_number}: {message}")]
    Encode {
        destination: String,
        block_number: u64,
        message: String,
    },
    #[error("destination `{destination}` cursor holds {value:?}")]
    BadCursor { destination: String, value: String },
    /// The destination is temporarily not accepting writes.
    #[error("destination `{destination}` is unavailable: {message}")]
    Unavailable {
        destination: String,
        message: String,
    },
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable { .. })
    }
}

/// A store that receives rows derived from blocks.
///
/// `write` must be durable before it resolves: once it returns, the
/// destination reports `through_block` from `committed_block`.
pub trait Destination: Send {
    fn name(&self) -> &str;

    /// The last block whose rows are durably written.
    fn committed_block(&mut self) -> BoxFuture<'_, Result<Option<u64>, SinkError>>;

    fn encode(&self, block: &StoredBlock) -> Result<Vec<Value>, SinkError>;

    fn write(&mut self, rows: Vec<Value>, through_block: u64) -> BoxFuture<'_, Result<(), SinkError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    high: usize,
    low: usize,
}

impl Watermarks {
    pub fn new(high: usize, low: usize) -> Result<Self, SinkError> {
        if low >= high {
            return Err(SinkError::InvalidWatermarks { high, low });
        }
        Ok(Self { high, low })
    }

    pub fn high(&self) -> usize {
        self.high
    }

    pub fn low(&self) -> usize {
        self.low
    }
}

/// Pause gate with hysteresis: closes when the buffered amount reaches the
/// high watermark and reopens only at or below the low one.
#[derive(Debug)]
pub struct Hysteresis {
    marks: Watermarks,
    buffered: usize,
    paused: bool,
}

impl Hysteresis {
    pub fn new(marks: Watermarks) -> Self {
        Self {
            marks,
            buffered: 0,
            paused: false,
        }
    }

    pub fn record_added(&mut self, amount: usize) {
        self.buffered += amount;
        if self.buffered >= self.marks.high {
            self.paused = true;
        }
    }

    pub fn record_released(&mut self, amount: usize) {
        self.buffered = self.buffered.saturating_sub(amount);
        if self.paused && self.buffered <= self.marks.low {
            self.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }
}
