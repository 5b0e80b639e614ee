use std::collections::HashSet;
use std::ops::RangeInclusive;

use block_ingest_common::StoredBlock;

/// Inclusive range of block numbers fetched and committed as one unit.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct BlockWindow {
    pub start: u64,
    pub end: u64,
}

impl BlockWindow {
    /// The window that follows `last_processed`, holding at most `batch_size`
    /// blocks and never reaching past `latest`. `None` once caught up.
    pub fn next(last_processed: Option<u64>, batch_size: u64, latest: u64) -> Option<Self> {
        let start = last_processed.map_or(0, |n| n + 1);
        if start > latest {
            return None;
        }
        let end = start
            .saturating_add(batch_size.max(1) - 1)
            .min(latest);
        Some(Self { start, end })
    }

    pub fn block_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn numbers(&self) -> RangeInclusive<u64> {
        self.start..=self.end
    }

    /// Numbers of this window with no block in `blocks`.
    pub fn missing_from(&self, blocks: &[StoredBlock]) -> Vec<u64> {
        let present = blocks.iter().map(StoredBlock::number).collect::<HashSet<_>>();
        self.numbers().filter(|n| !present.contains(n)).collect()
    }
}

impl std::fmt::Display for BlockWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}
