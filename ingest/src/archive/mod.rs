//! Append-only archive of blocks in rotating segment files.
//!
//! Blocks are written as JSON lines to a single open segment named
//! `{start}-temp.jsonl`. Once it grows past the configured size it is sealed:
//! compressed with zstd and renamed to `{start}-{end}.jsonl.zst`, which is
//! never modified again. Numbers are zero-padded so that lexical order of the
//! names is numeric order. Backup tooling should skip `*temp*` files.

mod reader;
mod sync;
mod writer;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub use reader::{ArchiveItem, ArchiveReader};
pub use sync::sync_archive;
pub use writer::ArchiveWriter;

const NUMBER_WIDTH: usize = 11;
const SEALED_SUFFIX: &str = ".jsonl.zst";
const OPEN_SUFFIX: &str = "-temp.jsonl";
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("malformed record in {} line {line}: {source}", .path.display())]
    Record {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("block gap detected: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("segment {} ends before block {expected}", .path.display())]
    TruncatedSegment { path: PathBuf, expected: u64 },
    #[error("open segment {} has no complete record", .path.display())]
    CorruptOpenSegment { path: PathBuf },
    #[error("could not encode block {block_number}: {source}")]
    Encode {
        block_number: u64,
        source: serde_json::Error,
    },
    #[error("archive task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ArchiveError {
    fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Size of the open segment at which it is sealed.
    pub segment_size_bytes: u64,
    /// Size of the write buffer in front of the open segment.
    pub flush_bytes: usize,
    pub compression_level: i32,
    /// Number of the first block of an empty archive.
    pub first_block: u64,
    /// First delay between polls of a tailed segment. Doubles up to
    /// `poll_max` while nothing new shows up.
    pub poll_initial: Duration,
    pub poll_max: Duration,
    /// Idle time after which a reader stops following the tip.
    pub tail_timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            segment_size_bytes: 64 * 1024 * 1024,
            flush_bytes: 1024 * 1024,
            compression_level: 3,
            first_block: 0,
            poll_initial: Duration::from_millis(50),
            poll_max: Duration::from_secs(2),
            tail_timeout: Duration::from_secs(30),
        }
    }
}

/// A file the archive recognizes by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentName {
    Sealed { start: u64, end: u64 },
    Open { start: u64 },
    Partial,
}

impl SegmentName {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        if name.ends_with(PARTIAL_SUFFIX) {
            return Some(Self::Partial);
        }
        if let Some(start) = name.strip_suffix(OPEN_SUFFIX) {
            return Some(Self::Open {
                start: parse_number(start)?,
            });
        }
        let (start, end) = name.strip_suffix(SEALED_SUFFIX)?.split_once('-')?;
        let (start, end) = (parse_number(start)?, parse_number(end)?);
        (start <= end).then_some(Self::Sealed { start, end })
    }
}

fn parse_number(s: &str) -> Option<u64> {
    if s.len() != NUMBER_WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub(crate) fn sealed_file_name(start: u64, end: u64) -> String {
    format!("{start:0NUMBER_WIDTH$}-{end:0NUMBER_WIDTH$}{SEALED_SUFFIX}")
}

pub(crate) fn open_file_name(start: u64) -> String {
    format!("{start:0NUMBER_WIDTH$}{OPEN_SUFFIX}")
}

/// What a directory scan found.
#[derive(Debug, Default)]
pub(crate) struct Layout {
    /// Sealed `(start, end)` ranges, sorted by start.
    pub sealed: Vec<(u64, u64)>,
    pub open: Option<u64>,
    pub partial: Vec<PathBuf>,
}

impl Layout {
    pub(crate) fn scan(dir: &Path) -> Result<Self, ArchiveError> {
        let mut layout = Layout::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(layout),
            Err(e) => return Err(ArchiveError::io(dir)(e)),
        };

        for entry in entries {
            let entry = entry.map_err(ArchiveError::io(dir))?;
            let Some(name) = entry.file_name().to_str().and_then(SegmentName::parse) else {
                continue;
            };
            match name {
                SegmentName::Sealed { start, end } => layout.sealed.push((start, end)),
                // Only one open segment is ever written; keep the newest.
                SegmentName::Open { start } => {
                    layout.open = Some(layout.open.map_or(start, |s| s.max(start)))
                }
                SegmentName::Partial => layout.partial.push(entry.path()),
            }
        }
        layout.sealed.sort_unstable();
        Ok(layout)
    }

    pub(crate) fn last_sealed_end(&self) -> Option<u64> {
        self.sealed.iter().map(|(_, end)| *end).max()
    }

    /// Lowest segment start above `number`.
    pub(crate) fn first_start_after(&self, number: u64) -> Option<u64> {
        self.sealed
            .iter()
            .map(|(start, _)| *start)
            .chain(self.open)
            .filter(|start| *start > number)
            .min()
    }

    /// The sealed segment whose range contains `number`.
    pub(crate) fn sealed_containing(&self, number: u64) -> Option<(u64, u64)> {
        self.sealed
            .iter()
            .copied()
            .find(|(start, end)| (*start..=*end).contains(&number))
    }
}
