use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use block_ingest::archive::{sync_archive, ArchiveConfig, ArchiveReader, ArchiveWriter};
use block_ingest::fetcher::BlockFetcher;
use block_ingest::index::{default_indexers, lookup_block, lookup_transaction, CheckpointReader, IndexDb};
use block_ingest::indexing_loop::{unix_now, IndexingLoop, LoopConfig};
use block_ingest::provider::CachedBlockSource;
use block_ingest::rpc::{BatchConfig, BatchQueue, BatchRpc, ChainIdentity, HttpTransport, RpcCall};
use block_ingest::sink::{Destination, JsonLinesDestination, SinkPipeline, Watermarks};
use block_ingest::store::{BlockStoreConfig, SqliteBlockStore};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use super::cli::{LookupTarget, RpcArgs};

/// Resolves on the first Ctrl-C.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("unable to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Builds the batched client and checks which chain the node serves.
async fn connect(args: &RpcArgs) -> Result<Arc<BatchRpc<HttpTransport>>> {
    let transport = HttpTransport::new(args.rpc_url.clone(), args.timeout())
        .context("building RPC transport")?;
    let rpc = Arc::new(BatchRpc::new(transport, args.batch_config()));

    let identity = args
        .chain_identity
        .identify(&rpc)
        .await
        .with_context(|| format!("identifying chain at {}", args.rpc_url))?;
    info!(chain = %identity, rpc_url = %args.rpc_url, "connected to node");
    if let Some(expected) = &args.expected_chain {
        if !expected.eq_ignore_ascii_case(&identity) {
            bail!("node serves chain {identity}, expected {expected}");
        }
    }
    Ok(rpc)
}

pub(crate) async fn index(
    rpc_args: RpcArgs,
    config: LoopConfig,
    store_path: PathBuf,
    index_path: PathBuf,
) -> Result<()> {
    let rpc = connect(&rpc_args).await?;
    let store = SqliteBlockStore::open(&store_path, BlockStoreConfig::default())
        .with_context(|| format!("opening block store {}", store_path.display()))?;
    let db = IndexDb::open_writer(&index_path)
        .with_context(|| format!("opening index {}", index_path.display()))?;

    let source = CachedBlockSource::new(BlockFetcher::new(rpc), store);
    let indexing = IndexingLoop::new(source, db, default_indexers(), config)?;
    indexing.run(ctrl_c()).await?;
    Ok(())
}

pub(crate) async fn archive(
    rpc_args: RpcArgs,
    config: LoopConfig,
    archive_dir: PathBuf,
    segment_size_mb: u64,
    first_block: u64,
) -> Result<()> {
    let rpc = connect(&rpc_args).await?;
    let archive_config = ArchiveConfig {
        segment_size_bytes: segment_size_mb * 1024 * 1024,
        first_block,
        ..Default::default()
    };
    let writer = tokio::task::spawn_blocking(move || ArchiveWriter::open(archive_dir, archive_config))
        .await?
        .context("opening archive")?;
    info!(dir = %writer.dir().display(), next_block = writer.next_block(), "archive opened");

    sync_archive(&BlockFetcher::new(rpc), writer, &config, ctrl_c()).await?;
    Ok(())
}

pub(crate) struct ExportOptions {
    pub(crate) archive_dir: PathBuf,
    pub(crate) output_dir: PathBuf,
    pub(crate) high_watermark: usize,
    pub(crate) low_watermark: usize,
    pub(crate) flush_interval: u64,
    pub(crate) tail_timeout: u64,
    pub(crate) first_block: u64,
}

pub(crate) async fn export(options: ExportOptions) -> Result<()> {
    let watermarks = Watermarks::new(options.high_watermark, options.low_watermark)?;
    let destinations: Vec<Box<dyn Destination>> = vec![
        Box::new(JsonLinesDestination::blocks(&options.output_dir)),
        Box::new(JsonLinesDestination::transactions(&options.output_dir)),
    ];
    let mut pipeline = SinkPipeline::new(
        destinations,
        watermarks,
        Duration::from_secs(options.flush_interval),
    )
    .await?;

    let from = pipeline.resume_block(options.first_block);
    info!(from, "exporting archive");
    let reader = ArchiveReader::new(
        &options.archive_dir,
        ArchiveConfig {
            tail_timeout: Duration::from_secs(options.tail_timeout),
            ..Default::default()
        },
    );

    let committed = pipeline.run_until(reader.iterate(from), ctrl_c()).await?;
    info!(committed_block = ?committed, "export finished");
    Ok(())
}

pub(crate) async fn status(
    index_path: PathBuf,
    rpc_url: Option<Url>,
    chain_identity: ChainIdentity,
) -> Result<()> {
    let reader = CheckpointReader::open(&index_path)
        .with_context(|| format!("opening index {}", index_path.display()))?;
    let mut report = serde_json::to_value(reader.status(unix_now())?)?;

    if let Some(url) = rpc_url {
        let transport = HttpTransport::new(url, Duration::from_secs(30))?;
        let rpc = Arc::new(BatchRpc::new(transport, BatchConfig::default()));
        // Both calls go out in the same wire request.
        let (queue, flusher) = BatchQueue::spawn(rpc, Duration::from_millis(10), 16);
        let (identity, head) = tokio::join!(
            queue.call(chain_identity.call()),
            queue.call(RpcCall::BlockNumber),
        );
        drop(queue);
        flusher.await?;

        report["chain"] = json!(chain_identity.parse(identity?)?);
        report["nodeBlockNumber"] =
            json!(block_ingest::rpc::decode_quantity("eth_blockNumber", head?)?);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub(crate) async fn lookup(
    store_path: PathBuf,
    index_path: PathBuf,
    target: LookupTarget,
) -> Result<()> {
    let db = IndexDb::open_reader(&index_path)
        .with_context(|| format!("opening index {}", index_path.display()))?;
    let store = SqliteBlockStore::open(&store_path, BlockStoreConfig::default())
        .with_context(|| format!("opening block store {}", store_path.display()))?;

    let found = match target {
        LookupTarget::Tx { hash } => lookup_transaction(db.conn(), &store, &hash)
            .await?
            .map(|location| {
                json!({
                    "blockNumber": location.block_number,
                    "transaction": location.transaction,
                    "receipt": location.receipt,
                })
            }),
        LookupTarget::Block { hash } => lookup_block(db.conn(), &store, &hash)
            .await?
            .map(serde_json::to_value)
            .transpose()?,
    };
    store.close().await?;

    match found {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => bail!("hash not found in the index"),
    }
    Ok(())
}
