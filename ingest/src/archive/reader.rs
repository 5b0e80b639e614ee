use std::fs::File;
use std::io::{self, BufRead as _, BufReader, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_stream::try_stream;
use block_ingest_common::StoredBlock;
use futures::Stream;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{open_file_name, sealed_file_name, ArchiveConfig, ArchiveError, Layout};

/// Records decoded ahead of the consumer for one sealed segment.
const DECODE_AHEAD: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveItem {
    pub block: StoredBlock,
    /// Set on the final block of a sealed segment. Blocks read from the open
    /// segment never carry it.
    pub is_last_of_segment: bool,
}

/// Sequential reader over an archive directory. Never writes to it.
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    dir: PathBuf,
    config: ArchiveConfig,
}

impl ArchiveReader {
    pub fn new(dir: impl AsRef<Path>, config: ArchiveConfig) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            config,
        }
    }

    /// Streams every archived block from `from` onwards, in order, then
    /// follows the open segment as it grows.
    ///
    /// The stream ends once nothing new has appeared for the configured tail
    /// timeout. Any discontinuity in block numbers ends it with an error.
    pub fn iterate(&self, from: u64) -> impl Stream<Item = Result<ArchiveItem, ArchiveError>> {
        let dir = self.dir.clone();
        let config = self.config.clone();
        try_stream! {
            let mut next = from;
            let mut idle = Idle::new(&config);
            let mut tail: Option<OpenTail> = None;

            loop {
                let layout = Layout::scan(&dir)?;

                if let Some((start, end)) = layout.sealed_containing(next) {
                    tail = None;
                    let path = dir.join(sealed_file_name(start, end));
                    debug!(path = %path.display(), from = next, "reading sealed segment");
                    let mut records = decode_sealed(path.clone(), next);
                    while let Some(block) = records.recv().await {
                        let block = block?;
                        check_continuity(next, &block)?;
                        next += 1;
                        yield ArchiveItem {
                            is_last_of_segment: block.number() == end,
                            block,
                        };
                    }
                    check_complete(&path, next, end)?;
                    idle.reset();
                    continue;
                }

                // Nothing covers `next` yet, so any later segment means a hole.
                check_no_hole(&layout, next)?;

                if let Some(start) = layout.open.filter(|start| *start <= next) {
                    let current = match tail.take() {
                        Some(current) if current.start == start && !current.is_gone() => current,
                        _ => OpenTail::new(dir.join(open_file_name(start)), start),
                    };
                    let current = tail.insert(current);
                    let blocks = current.read_new(next).await?;
                    if !blocks.is_empty() {
                        for block in blocks {
                            check_continuity(next, &block)?;
                            next += 1;
                            yield ArchiveItem {
                                block,
                                is_last_of_segment: false,
                            };
                        }
                        idle.reset();
                        continue;
                    }
                }

                let Some(delay) = idle.next_delay() else {
                    debug!(next_block = next, "archive reader caught up");
                    break;
                };
                trace!(?delay, next_block = next, "waiting for archive to grow");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn check_complete(path: &Path, next: u64, end: u64) -> Result<(), ArchiveError> {
    if next <= end {
        return Err(ArchiveError::TruncatedSegment {
            path: path.to_path_buf(),
            expected: next,
        });
    }
    Ok(())
}

fn check_no_hole(layout: &Layout, next: u64) -> Result<(), ArchiveError> {
    match layout.first_start_after(next) {
        Some(got) => Err(ArchiveError::Gap {
            expected: next,
            got,
        }),
        None => Ok(()),
    }
}

fn check_continuity(expected: u64, block: &StoredBlock) -> Result<(), ArchiveError> {
    if block.number() != expected {
        return Err(ArchiveError::Gap {
            expected,
            got: block.number(),
        });
    }
    Ok(())
}

/// Decodes a sealed segment on a blocking thread, sending blocks numbered
/// `from` and above.
fn decode_sealed(path: PathBuf, from: u64) -> mpsc::Receiver<Result<StoredBlock, ArchiveError>> {
    let (tx, rx) = mpsc::channel(DECODE_AHEAD);
    tokio::task::spawn_blocking(move || {
        let result = (|| -> Result<(), ArchiveError> {
            let file = File::open(&path).map_err(ArchiveError::io(&path))?;
            let decoder = zstd::stream::read::Decoder::new(file).map_err(ArchiveError::io(&path))?;
            for (index, line) in BufReader::new(decoder).lines().enumerate() {
                let line = line.map_err(ArchiveError::io(&path))?;
                let block: StoredBlock =
                    serde_json::from_str(&line).map_err(|source| ArchiveError::Record {
                        path: path.clone(),
                        line: index + 1,
                        source,
                    })?;
                if block.number() < from {
                    continue;
                }
                if tx.blocking_send(Ok(block)).is_err() {
                    // Consumer went away.
                    return Ok(());
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _ = tx.blocking_send(Err(e));
        }
    });
    rx
}

/// Follows the open segment by byte offset, handing out complete lines only.
///
/// The offset only moves past newline-terminated records. A torn tail is
/// read again on every call, so when the writer truncates it away after a
/// restart the records written in its place are picked up intact.
struct OpenTail {
    path: PathBuf,
    start: u64,
    offset: u64,
    lines: usize,
    gone: bool,
}

impl OpenTail {
    fn new(path: PathBuf, start: u64) -> Self {
        Self {
            path,
            start,
            offset: 0,
            lines: 0,
            gone: false,
        }
    }

    fn is_gone(&self) -> bool {
        self.gone
    }

    /// Blocks numbered `from` and above that were appended since the last
    /// call.
    async fn read_new(&mut self, from: u64) -> Result<Vec<StoredBlock>, ArchiveError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.gone = true;
                return Ok(Vec::new());
            }
            Err(e) => return Err(ArchiveError::io(&self.path)(e)),
        };
        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(ArchiveError::io(&self.path))?;
        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh)
            .await
            .map_err(ArchiveError::io(&self.path))?;

        let Some(last_newline) = fresh.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &fresh[..=last_newline];

        let mut blocks = Vec::new();
        for line in complete.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
            let block: StoredBlock =
                serde_json::from_slice(line).map_err(|source| ArchiveError::Record {
                    path: self.path.clone(),
                    line: self.lines + 1,
                    source,
                })?;
            self.lines += 1;
            if block.number() >= from {
                blocks.push(block);
            }
        }
        self.offset += complete.len() as u64;
        trace!(
            segment = self.start,
            offset = self.offset,
            torn = fresh.len() - complete.len(),
            blocks = blocks.len(),
            "read open segment"
        );
        Ok(blocks)
    }
}

/// Poll delays while the archive is not growing.
struct Idle {
    initial: Duration,
    max: Duration,
    timeout: Duration,
    delay: Duration,
    waited: Duration,
}

impl Idle {
    fn new(config: &ArchiveConfig) -> Self {
        Self {
            initial: config.poll_initial,
            max: config.poll_max,
            timeout: config.tail_timeout,
            delay: config.poll_initial,
            waited: Duration::ZERO,
        }
    }

    fn reset(&mut self) {
        self.delay = self.initial;
        self.waited = Duration::ZERO;
    }

    /// `None` once the total wait would exceed the timeout.
    fn next_delay(&mut self) -> Option<Duration> {
        if self.waited >= self.timeout {
            return None;
        }
        let delay = self.delay.min(self.timeout - self.waited);
        self.waited += delay;
        self.delay = (self.delay * 2).min(self.max);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_backs_off_up_to_the_cap_and_gives_up() {
        let mut idle = Idle::new(&ArchiveConfig {
            poll_initial: Duration::from_millis(100),
            poll_max: Duration::from_millis(300),
            tail_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        let delays = std::iter::from_fn(|| idle.next_delay())
            .map(|d| d.as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![100, 200, 300, 300, 100]);

        idle.reset();
        assert_eq!(idle.next_delay(), Some(Duration::from_millis(100)));
    }
}
