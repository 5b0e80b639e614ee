mod common;

use std::path::Path;
use std::time::Duration;

use block_ingest::archive::{
    sync_archive, ArchiveConfig, ArchiveError, ArchiveItem, ArchiveReader, ArchiveWriter,
};
use block_ingest::fetcher::BlockFetcher;
use block_ingest::indexing_loop::LoopConfig;
use common::{make_block, FakeNode};
use futures::{StreamExt as _, TryStreamExt as _};
use tokio::sync::oneshot;

fn config(first_block: u64) -> ArchiveConfig {
    ArchiveConfig {
        first_block,
        poll_initial: Duration::from_millis(5),
        poll_max: Duration::from_millis(20),
        tail_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn write_blocks(writer: &mut ArchiveWriter, range: std::ops::RangeInclusive<u64>) {
    for number in range {
        writer.append(&make_block(number, 1)).unwrap();
    }
    writer.flush().unwrap();
}

async fn read_all(dir: &Path, from: u64) -> Result<Vec<ArchiveItem>, ArchiveError> {
    ArchiveReader::new(dir, config(0))
        .iterate(from)
        .try_collect()
        .await
}

#[tokio::test]
async fn reads_across_sealed_and_open_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ArchiveWriter::open(dir.path(), config(1)).unwrap();
    write_blocks(&mut writer, 1..=999);
    writer.seal().unwrap();
    write_blocks(&mut writer, 1000..=1999);

    let items = read_all(dir.path(), 500).await.unwrap();

    let numbers = items.iter().map(|i| i.block.number()).collect::<Vec<_>>();
    assert_eq!(numbers, (500..=1999).collect::<Vec<_>>());
    let last_of_segment = items
        .iter()
        .filter(|i| i.is_last_of_segment)
        .map(|i| i.block.number())
        .collect::<Vec<_>>();
    assert_eq!(last_of_segment, vec![999]);
    assert_eq!(items[0].block, make_block(500, 1));

    // Same view once the second segment is sealed too.
    writer.seal().unwrap();
    let sealed = read_all(dir.path(), 500).await.unwrap();
    assert_eq!(sealed.len(), 1500);
    assert!(sealed[499].is_last_of_segment);
    assert!(sealed[1499].is_last_of_segment);
    assert_eq!(sealed.iter().filter(|i| i.is_last_of_segment).count(), 2);
}

#[tokio::test]
async fn follows_the_open_segment_as_it_grows() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ArchiveWriter::open(dir.path(), config(0)).unwrap();
    write_blocks(&mut writer, 0..=9);

    let reader = ArchiveReader::new(dir.path(), config(0));
    let stream = reader.iterate(0);
    let write_more = async move {
        for chunk in [10..=19, 20..=29] {
            tokio::time::sleep(Duration::from_millis(30)).await;
            write_blocks(&mut writer, chunk);
        }
        // Sealing mid-tail hands the reader over to the compressed segment.
        writer.seal().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        write_blocks(&mut writer, 30..=34);
    };

    let collect = stream.map(|item| item.unwrap()).collect::<Vec<_>>();
    let (items, ()) = tokio::join!(collect, write_more);

    let numbers = items.iter().map(|i| i.block.number()).collect::<Vec<_>>();
    assert_eq!(numbers, (0..=34).collect::<Vec<_>>());
}

#[tokio::test]
async fn a_tail_truncated_by_a_restarted_writer_is_read_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ArchiveWriter::open(dir.path(), config(0)).unwrap();
    write_blocks(&mut writer, 0..=4);
    drop(writer);

    let stream = ArchiveReader::new(dir.path(), config(0)).iterate(0);
    let path = dir.path().join("00000000000-temp.jsonl");
    let crash_and_restart = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        // The writer dies mid-record; the reader sees the torn bytes.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, br#"{"torn":tru"#).unwrap();
        drop(file);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Reopening truncates the torn record and appends fresh ones in its
        // place, so the file ends up longer than what the reader saw.
        let mut writer = ArchiveWriter::open(dir.path(), config(0)).unwrap();
        assert_eq!(writer.next_block(), 5);
        write_blocks(&mut writer, 5..=9);
        writer
    };

    let collect = stream.map(|item| item.unwrap()).collect::<Vec<_>>();
    let (items, _writer) = tokio::join!(collect, crash_and_restart);

    let numbers = items.iter().map(|i| i.block.number()).collect::<Vec<_>>();
    assert_eq!(numbers, (0..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn stops_at_a_hole_between_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ArchiveWriter::open(dir.path(), config(1)).unwrap();
    write_blocks(&mut writer, 1..=10);
    writer.seal().unwrap();
    drop(writer);

    // A segment that starts past the end of the first one.
    let other = tempfile::tempdir().unwrap();
    let mut later = ArchiveWriter::open(other.path(), config(20)).unwrap();
    write_blocks(&mut later, 20..=30);
    later.seal().unwrap();
    std::fs::rename(
        other.path().join("00000000020-00000000030.jsonl.zst"),
        dir.path().join("00000000020-00000000030.jsonl.zst"),
    )
    .unwrap();

    let items = ArchiveReader::new(dir.path(), config(0))
        .iterate(1)
        .collect::<Vec<_>>()
        .await;

    assert_eq!(items.len(), 11);
    assert!(items[..10].iter().all(Result::is_ok));
    assert!(matches!(
        items[10],
        Err(ArchiveError::Gap {
            expected: 11,
            got: 20
        })
    ));
}

#[tokio::test]
async fn sync_appends_fetched_windows() {
    let dir = tempfile::tempdir().unwrap();
    let node = FakeNode::with_blocks(0..=45, 2);
    let fetcher = BlockFetcher::new(node.rpc());
    let writer = ArchiveWriter::open(dir.path(), config(0)).unwrap();
    let loop_config = LoopConfig {
        blocks_per_batch: 10,
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        ..Default::default()
    };

    let (stop, stopped) = oneshot::channel::<()>();
    let reader = ArchiveReader::new(dir.path(), config(0));
    let watch = async move {
        let items = reader
            .iterate(0)
            .take(46)
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await;
        stop.send(()).unwrap();
        items
    };
    let shutdown = async move {
        let _ = stopped.await;
    };

    let (synced, items) = tokio::join!(
        sync_archive(&fetcher, writer, &loop_config, shutdown),
        watch
    );
    synced.unwrap();

    assert_eq!(items.len(), 46);
    assert_eq!(items[45].block, node.block(45));

    // Reopening continues where the archive ends.
    let writer = ArchiveWriter::open(dir.path(), config(0)).unwrap();
    assert_eq!(writer.next_block(), 46);
}
