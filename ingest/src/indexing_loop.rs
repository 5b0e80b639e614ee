//! The checkpointed loop feeding blocks to the registered indexers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::index::{Checkpoint, IndexDb, Indexers};
use crate::provider::CachedBlockSource;
use crate::rpc::RpcTransport;
use crate::window::BlockWindow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Upper bound on the blocks committed in one transaction.
    pub blocks_per_batch: u64,
    /// Sleep between tip checks once caught up.
    pub poll_interval: Duration,
    /// Sleep before retrying a cycle that failed with a transient error.
    pub error_backoff: Duration,
    /// Minimum time between two heartbeat writes.
    pub heartbeat_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            blocks_per_batch: 100,
            poll_interval: Duration::from_secs(20),
            error_backoff: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    CatchingUp,
    WaitingForNewBlocks,
    ShuttingDown,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self {
            LoopState::Initializing => "initializing",
            LoopState::CatchingUp => "catching up",
            LoopState::WaitingForNewBlocks => "waiting for new blocks",
            LoopState::ShuttingDown => "shutting down",
        };
        f.write_str(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Processed(BlockWindow),
    /// The checkpoint is at the remote tip.
    CaughtUp,
}

struct IndexState {
    db: IndexDb,
    indexers: Indexers,
}

/// Owns the checkpoint and drives the indexers, one committed window at a
/// time.
pub struct IndexingLoop<T> {
    source: CachedBlockSource<T>,
    index: Arc<Mutex<IndexState>>,
    config: LoopConfig,
    checkpoint: Checkpoint,
    state: watch::Sender<LoopState>,
    last_heartbeat: Option<Instant>,
}

impl<T: RpcTransport> IndexingLoop<T> {
    /// Initializes every indexer against `db` and loads the checkpoint.
    pub fn new(
        source: CachedBlockSource<T>,
        db: IndexDb,
        mut indexers: Indexers,
        config: LoopConfig,
    ) -> Result<Self, IngestError> {
        let (state, _) = watch::channel(LoopState::Initializing);
        indexers.initialize(&db)?;
        let checkpoint = db.checkpoint()?;
        info!(
            indexers = ?indexers.names(),
            last_processed_block = ?checkpoint.last_processed_block,
            latest_block_number = checkpoint.latest_block_number,
            "initialized indexers"
        );

        Ok(Self {
            source,
            index: Arc::new(Mutex::new(IndexState { db, indexers })),
            config,
            checkpoint,
            state,
            last_heartbeat: None,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn source(&self) -> &CachedBlockSource<T> {
        &self.source
    }

    /// Runs `f` against the index database. Blocks while a window commits.
    pub fn with_db<R>(&self, f: impl FnOnce(&IndexDb) -> R) -> R {
        f(&self.index.lock().db)
    }

    /// One pass: refresh the tip when the next window would reach the known
    /// one, then fetch and commit the next window. Nothing is committed when
    /// an error is returned.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, IngestError> {
        let mut window = self.next_window();
        if window.map_or(true, |w| w.end >= self.checkpoint.latest_block_number) {
            let latest = self.source.fetcher().rpc().block_number().await?;
            debug!(latest_block_number = latest, "refreshed chain tip");
            self.checkpoint.latest_block_number = latest;
            window = self.next_window();
        }
        let Some(window) = window else {
            return Ok(CycleOutcome::CaughtUp);
        };

        let blocks = self
            .source
            .get_blocks(&window.numbers().collect::<Vec<_>>())
            .await?;
        let missing = window.missing_from(&blocks);
        if !missing.is_empty() {
            return Err(IngestError::IncompleteWindow { window, missing });
        }

        let index = self.index.clone();
        let latest = self.checkpoint.latest_block_number;
        tokio::task::spawn_blocking(move || {
            let mut guard = index.lock();
            let IndexState { db, indexers } = &mut *guard;
            db.commit_window(indexers, window, &blocks, latest)
        })
        .await
        .map_err(crate::index::IndexerError::from)??;

        self.checkpoint.last_processed_block = Some(window.end);
        Ok(CycleOutcome::Processed(window))
    }

    /// Runs cycles until `shutdown` resolves or an error that must not be
    /// retried occurs.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), IngestError> {
        tokio::pin!(shutdown);

        loop {
            self.heartbeat().await?;

            let outcome = tokio::select! {
                biased;
                () = &mut shutdown => break,
                outcome = self.run_cycle() => outcome,
            };
            let delay = match outcome {
                Ok(CycleOutcome::Processed(window)) => {
                    self.set_state(LoopState::CatchingUp);
                    info!(
                        %window,
                        latest_block_number = self.checkpoint.latest_block_number,
                        "indexed window"
                    );
                    continue;
                }
                Ok(CycleOutcome::CaughtUp) => {
                    self.set_state(LoopState::WaitingForNewBlocks);
                    self.config.poll_interval
                }
                Err(e) if e.is_retryable() => {
                    warn!(backoff = ?self.config.error_backoff, "indexing cycle failed: {e}");
                    self.set_state(LoopState::CatchingUp);
                    self.config.error_backoff
                }
                Err(e) => {
                    error!("indexing stopped: {e}");
                    self.set_state(LoopState::ShuttingDown);
                    return Err(e);
                }
            };
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        self.set_state(LoopState::ShuttingDown);
        self.source.store().flush().await?;
        info!(checkpoint = ?self.checkpoint, "indexing loop stopped");
        Ok(())
    }

    fn next_window(&self) -> Option<BlockWindow> {
        BlockWindow::next(
            self.checkpoint.last_processed_block,
            self.config.blocks_per_batch,
            self.checkpoint.latest_block_number,
        )
    }

    async fn heartbeat(&mut self) -> Result<(), IngestError> {
        let due = self
            .last_heartbeat
            .map_or(true, |at| at.elapsed() >= self.config.heartbeat_interval);
        if !due {
            return Ok(());
        }

        let now = unix_now();
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || index.lock().db.record_heartbeat(now))
            .await
            .map_err(crate::index::IndexerError::from)??;
        self.checkpoint.last_updated_timestamp = now;
        self.last_heartbeat = Some(Instant::now());
        self.source.fetcher().rpc().stats().log_and_reset();
        Ok(())
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "indexing loop state");
            *current = state;
            true
        });
    }
}

/// `true` when `shutdown` resolved before `delay` elapsed.
pub(crate) async fn sleep_or_shutdown<F>(delay: Duration, shutdown: &mut F) -> bool
where
    F: Future<Output = ()> + Unpin,
{
    tokio::select! {
        () = shutdown => true,
        () = tokio::time::sleep(delay) => false,
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
