use std::fs::{self, File};
use std::io::{self, BufWriter, Write as _};
use std::path::{Path, PathBuf};

use block_ingest_common::StoredBlock;
use tracing::{debug, info, warn};

use super::{open_file_name, sealed_file_name, ArchiveConfig, ArchiveError, Layout, PARTIAL_SUFFIX};

/// The single writer of an archive directory.
pub struct ArchiveWriter {
    dir: PathBuf,
    config: ArchiveConfig,
    next_block: u64,
    open: Option<OpenSegment>,
}

struct OpenSegment {
    start: u64,
    path: PathBuf,
    file: BufWriter<File>,
    /// Bytes in the segment including those still buffered.
    size: u64,
}

impl ArchiveWriter {
    /// Opens `dir`, creating it if needed, and recovers the resume point from
    /// the segments already there.
    pub fn open(dir: impl AsRef<Path>, config: ArchiveConfig) -> Result<Self, ArchiveError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(ArchiveError::io(&dir))?;

        let layout = Layout::scan(&dir)?;
        for partial in &layout.partial {
            debug!(path = %partial.display(), "removing interrupted seal");
            fs::remove_file(partial).map_err(ArchiveError::io(partial))?;
        }

        let mut writer = Self {
            next_block: layout
                .last_sealed_end()
                .map_or(config.first_block, |end| end + 1),
            dir,
            config,
            open: None,
        };

        if let Some(start) = layout.open {
            let path = writer.dir.join(open_file_name(start));
            if layout.last_sealed_end().is_some_and(|end| start <= end) {
                // Sealed, but the process stopped before removing the source.
                debug!(path = %path.display(), "removing already sealed segment");
                fs::remove_file(&path).map_err(ArchiveError::io(&path))?;
            } else if start != writer.next_block {
                return Err(ArchiveError::Gap {
                    expected: writer.next_block,
                    got: start,
                });
            } else {
                writer.resume_open_segment(start, path)?;
            }
        }

        info!(
            dir = %writer.dir.display(),
            next_block = writer.next_block,
            "opened archive"
        );
        Ok(writer)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The only block number `append` accepts next.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    pub fn append(&mut self, block: &StoredBlock) -> Result<(), ArchiveError> {
        if block.number() != self.next_block {
            return Err(ArchiveError::Gap {
                expected: self.next_block,
                got: block.number(),
            });
        }

        let mut line = serde_json::to_vec(block).map_err(|source| ArchiveError::Encode {
            block_number: block.number(),
            source,
        })?;
        line.push(b'\n');

        let segment = match self.open.take() {
            Some(segment) => self.open.insert(segment),
            None => {
                let segment = self.create_segment(self.next_block)?;
                self.open.insert(segment)
            }
        };
        segment
            .file
            .write_all(&line)
            .map_err(ArchiveError::io(&segment.path))?;
        segment.size += line.len() as u64;
        self.next_block += 1;

        if segment.size >= self.config.segment_size_bytes {
            self.seal()?;
        }
        Ok(())
    }

    pub fn append_all<'a>(
        &mut self,
        blocks: impl IntoIterator<Item = &'a StoredBlock>,
    ) -> Result<(), ArchiveError> {
        blocks.into_iter().try_for_each(|block| self.append(block))
    }

    /// Pushes buffered records to the open segment so readers can see them.
    pub fn flush(&mut self) -> Result<(), ArchiveError> {
        if let Some(segment) = &mut self.open {
            segment
                .file
                .flush()
                .map_err(ArchiveError::io(&segment.path))?;
        }
        Ok(())
    }

    /// Compresses the open segment into its immutable form. A no-op when
    /// nothing has been appended since the last seal.
    pub fn seal(&mut self) -> Result<(), ArchiveError> {
        let Some(mut segment) = self.open.take() else {
            return Ok(());
        };
        if self.next_block == segment.start {
            // Reopened after a crash with no intact record: nothing to seal.
            drop(segment.file);
            fs::remove_file(&segment.path).map_err(ArchiveError::io(&segment.path))?;
            debug!(start = segment.start, "removed empty open segment");
            return Ok(());
        }
        let end = self.next_block - 1;
        segment
            .file
            .flush()
            .and_then(|()| segment.file.get_ref().sync_all())
            .map_err(ArchiveError::io(&segment.path))?;
        drop(segment.file);

        let sealed = self.dir.join(sealed_file_name(segment.start, end));
        let partial = sealed.with_file_name(format!(
            "{}{PARTIAL_SUFFIX}",
            sealed_file_name(segment.start, end)
        ));
        compress(&segment.path, &partial, self.config.compression_level)?;
        fs::rename(&partial, &sealed).map_err(ArchiveError::io(&partial))?;
        fs::remove_file(&segment.path).map_err(ArchiveError::io(&segment.path))?;

        info!(
            start = segment.start,
            end,
            bytes = segment.size,
            "sealed archive segment"
        );
        Ok(())
    }

    /// Flushes and syncs the open segment without sealing it.
    pub fn close(mut self) -> Result<(), ArchiveError> {
        self.flush()?;
        if let Some(segment) = &self.open {
            segment
                .file
                .get_ref()
                .sync_all()
                .map_err(ArchiveError::io(&segment.path))?;
        }
        Ok(())
    }

    fn create_segment(&self, start: u64) -> Result<OpenSegment, ArchiveError> {
        let path = self.dir.join(open_file_name(start));
        let file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(ArchiveError::io(&path))?;
        debug!(path = %path.display(), "started archive segment");
        Ok(OpenSegment {
            start,
            path,
            file: BufWriter::with_capacity(self.config.flush_bytes, file),
            size: 0,
        })
    }

    /// Picks up an open segment left by a previous run. A torn final record is
    /// cut off as long as an intact record precedes it.
    fn resume_open_segment(&mut self, start: u64, path: PathBuf) -> Result<(), ArchiveError> {
        let contents = fs::read(&path).map_err(ArchiveError::io(&path))?;
        let recovered = recover_records(&path, start, &contents)?;

        if recovered.valid_len < contents.len() as u64 {
            warn!(
                path = %path.display(),
                discarded = contents.len() as u64 - recovered.valid_len,
                "discarding torn record at the end of the open segment"
            );
            File::options()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_len(recovered.valid_len))
                .map_err(ArchiveError::io(&path))?;
        }

        let mut segment = self.create_segment(start)?;
        segment.size = recovered.valid_len;
        self.next_block = start + recovered.records;
        self.open = Some(segment);
        Ok(())
    }
}

struct Recovered {
    records: u64,
    valid_len: u64,
}

fn recover_records(path: &Path, start: u64, contents: &[u8]) -> Result<Recovered, ArchiveError> {
    let mut recovered = Recovered {
        records: 0,
        valid_len: 0,
    };
    let mut offset = 0;
    while offset < contents.len() {
        let rest = &contents[offset..];
        let terminated = rest.iter().position(|b| *b == b'\n');
        let line = &rest[..terminated.unwrap_or(rest.len())];
        let is_last = terminated.map_or(true, |end| offset + end + 1 == contents.len());

        let intact = match (terminated, serde_json::from_slice::<StoredBlock>(line)) {
            (Some(_), Ok(block)) => Some(block),
            (_, Err(source)) if !is_last => {
                return Err(ArchiveError::Record {
                    path: path.to_path_buf(),
                    line: recovered.records as usize + 1,
                    source,
                })
            }
            // Unterminated or unreadable final line: the write was torn.
            _ => None,
        };
        let Some(block) = intact else {
            if recovered.records > 0 {
                break;
            }
            return Err(ArchiveError::CorruptOpenSegment {
                path: path.to_path_buf(),
            });
        };

        let expected = start + recovered.records;
        if block.number() != expected {
            return Err(ArchiveError::Gap {
                expected,
                got: block.number(),
            });
        }
        recovered.records += 1;
        offset += line.len() + 1;
        recovered.valid_len = offset as u64;
    }
    Ok(recovered)
}

fn compress(source: &Path, target: &Path, level: i32) -> Result<(), ArchiveError> {
    let input = File::open(source).map_err(ArchiveError::io(source))?;
    let output = File::create(target).map_err(ArchiveError::io(target))?;
    let result = zstd::stream::copy_encode(io::BufReader::new(input), &output, level)
        .and_then(|()| output.sync_all());
    if let Err(e) = result {
        let _ = fs::remove_file(target);
        return Err(ArchiveError::io(target)(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use block_ingest_common::{Block, Receipt, Transaction, B256};

    use super::*;
    use crate::archive::SegmentName;

    fn block(number: u64) -> StoredBlock {
        let tx = B256::with_last_byte(number as u8);
        StoredBlock::new(
            Block::new(number, B256::repeat_byte(1), B256::ZERO, 0, vec![Transaction::new(tx)]),
            [Receipt::new(tx, number)],
        )
        .unwrap()
    }

    fn names(dir: &Path) -> Vec<SegmentName> {
        let mut names = fs::read_dir(dir)
            .unwrap()
            .map(|e| SegmentName::parse(e.unwrap().file_name().to_str().unwrap()).unwrap())
            .collect::<Vec<_>>();
        names.sort_by_key(|name| match name {
            SegmentName::Sealed { start, .. } | SegmentName::Open { start } => *start,
            SegmentName::Partial => u64::MAX,
        });
        names
    }

    fn config() -> ArchiveConfig {
        ArchiveConfig {
            first_block: 1,
            ..Default::default()
        }
    }

    #[test]
    fn it_rotates_segments_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let line = serde_json::to_vec(&block(1)).unwrap().len() as u64 + 1;
        let mut writer = ArchiveWriter::open(
            dir.path(),
            ArchiveConfig {
                segment_size_bytes: line * 3,
                ..config()
            },
        )
        .unwrap();

        for n in 1..=7 {
            writer.append(&block(n)).unwrap();
        }
        writer.close().unwrap();

        assert_eq!(
            names(dir.path()),
            vec![
                SegmentName::Sealed { start: 1, end: 3 },
                SegmentName::Sealed { start: 4, end: 6 },
                SegmentName::Open { start: 7 },
            ]
        );
    }

    #[test]
    fn it_rejects_out_of_order_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::open(dir.path(), config()).unwrap();
        writer.append(&block(1)).unwrap();
        assert!(matches!(
            writer.append(&block(3)),
            Err(ArchiveError::Gap {
                expected: 2,
                got: 3
            })
        ));
        assert!(writer.append(&block(1)).is_err());
        assert_eq!(writer.next_block(), 2);
    }

    #[test]
    fn it_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::open(dir.path(), config()).unwrap();
        writer.append_all(&[block(1), block(2)]).unwrap();
        writer.seal().unwrap();
        writer.append_all(&[block(3), block(4)]).unwrap();
        writer.close().unwrap();

        let mut writer = ArchiveWriter::open(dir.path(), config()).unwrap();
        assert_eq!(writer.next_block(), 5);
        writer.append(&block(5)).unwrap();
        writer.seal().unwrap();
        assert_eq!(
            names(dir.path()),
            vec![
                SegmentName::Sealed { start: 1, end: 2 },
                SegmentName::Sealed { start: 3, end: 5 },
            ]
        );
    }

    #[test]
    fn it_discards_a_torn_final_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::open(dir.path(), config()).unwrap();
        writer.append_all(&[block(1), block(2)]).unwrap();
        writer.close().unwrap();

        let path = dir.path().join(open_file_name(1));
        let intact = fs::metadata(&path).unwrap().len();
        let mut file = File::options().append(true).open(&path).unwrap();
        file.write_all(br#"{"block":{"number":"0x3""#).unwrap();
        drop(file);

        let writer = ArchiveWriter::open(dir.path(), config()).unwrap();
        assert_eq!(writer.next_block(), 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn it_drops_an_empty_open_segment_on_seal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(open_file_name(0)), b"").unwrap();
        let config = ArchiveConfig {
            first_block: 0,
            ..Default::default()
        };

        let mut writer = ArchiveWriter::open(dir.path(), config).unwrap();
        assert_eq!(writer.next_block(), 0);
        writer.seal().unwrap();
        assert_eq!(names(dir.path()), vec![]);
        assert_eq!(writer.next_block(), 0);

        writer.append(&block(0)).unwrap();
        writer.seal().unwrap();
        assert_eq!(
            names(dir.path()),
            vec![SegmentName::Sealed { start: 0, end: 0 }]
        );
    }

    #[test]
    fn it_refuses_an_open_segment_without_intact_records() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(open_file_name(1)), br#"{"blo"#).unwrap();
        assert!(matches!(
            ArchiveWriter::open(dir.path(), config()),
            Err(ArchiveError::CorruptOpenSegment { .. })
        ));
    }

    #[test]
    fn it_cleans_up_interrupted_seals() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::open(dir.path(), config()).unwrap();
        writer.append_all(&[block(1), block(2)]).unwrap();
        writer.close().unwrap();

        // Crash after the rename but before the source was removed.
        let open = dir.path().join(open_file_name(1));
        let sealed = dir.path().join(sealed_file_name(1, 2));
        compress(&open, &sealed, 3).unwrap();
        fs::write(dir.path().join("00000000003-00000000009.jsonl.zst.partial"), b"").unwrap();

        let writer = ArchiveWriter::open(dir.path(), config()).unwrap();
        assert_eq!(writer.next_block(), 3);
        assert_eq!(
            names(dir.path()),
            vec![SegmentName::Sealed { start: 1, end: 2 }]
        );
    }
}
