use std::future::Future;

use block_ingest_common::StoredBlock;
use tracing::{debug, error, info, warn};

use super::{ArchiveError, ArchiveWriter};
use crate::error::IngestError;
use crate::fetcher::BlockFetcher;
use crate::indexing_loop::{sleep_or_shutdown, LoopConfig};
use crate::rpc::RpcTransport;
use crate::window::BlockWindow;

/// Appends fetched windows to the archive until the remote tip, then keeps
/// following it until `shutdown` resolves.
///
/// Transient fetch failures are retried after `config.error_backoff`; every
/// other error is returned. The open segment is flushed after each window and
/// synced on shutdown, but not sealed.
pub async fn sync_archive<T: RpcTransport>(
    fetcher: &BlockFetcher<T>,
    writer: ArchiveWriter,
    config: &LoopConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), IngestError> {
    tokio::pin!(shutdown);
    let mut writer = writer;
    let mut latest = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = &mut shutdown => break,
            next = next_window(fetcher, writer.next_block(), config, &mut latest) => next,
        };

        let delay = match next {
            Ok(Some((window, blocks))) => {
                writer = append_blocking(writer, blocks).await?;
                info!(%window, latest_block_number = latest, "archived window");
                continue;
            }
            Ok(None) => {
                debug!(next_block = writer.next_block(), "archive is at the chain tip");
                config.poll_interval
            }
            Err(e) if e.is_retryable() => {
                warn!(backoff = ?config.error_backoff, "archive cycle failed: {e}");
                config.error_backoff
            }
            Err(e) => {
                error!("archiving stopped: {e}");
                return Err(e);
            }
        };
        if sleep_or_shutdown(delay, &mut shutdown).await {
            break;
        }
    }

    tokio::task::spawn_blocking(move || writer.close())
        .await
        .map_err(ArchiveError::from)??;
    info!("archive writer stopped");
    Ok(())
}

async fn next_window<T: RpcTransport>(
    fetcher: &BlockFetcher<T>,
    next_block: u64,
    config: &LoopConfig,
    latest: &mut u64,
) -> Result<Option<(BlockWindow, Vec<StoredBlock>)>, IngestError> {
    let last_written = next_block.checked_sub(1);
    let mut window = BlockWindow::next(last_written, config.blocks_per_batch, *latest);
    if window.map_or(true, |w| w.end >= *latest) {
        *latest = fetcher.rpc().block_number().await?;
        window = BlockWindow::next(last_written, config.blocks_per_batch, *latest);
    }
    let Some(window) = window else {
        return Ok(None);
    };

    let blocks = fetcher
        .fetch_range(&window.numbers().collect::<Vec<_>>())
        .await?;
    let missing = window.missing_from(&blocks);
    if !missing.is_empty() {
        return Err(IngestError::IncompleteWindow { window, missing });
    }
    Ok(Some((window, blocks)))
}

/// File writes and sealing run off the async workers. The writer is handed
/// back so the loop keeps ownership between windows.
async fn append_blocking(
    mut writer: ArchiveWriter,
    blocks: Vec<StoredBlock>,
) -> Result<ArchiveWriter, ArchiveError> {
    tokio::task::spawn_blocking(move || -> Result<ArchiveWriter, ArchiveError> {
        writer.append_all(&blocks)?;
        writer.flush()?;
        Ok(writer)
    })
    .await?
}
