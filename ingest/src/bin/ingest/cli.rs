use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::B256;
use block_ingest::indexing_loop::LoopConfig;
use block_ingest::rpc::{BatchConfig, ChainIdentity};
use clap::{Args, Parser, Subcommand, ValueHint};
use url::Url;

const RPC_HELP_HEADING: &str = "RPC options";
const LOOP_HELP_HEADING: &str = "Loop options";

/// Block ingestion, indexing and archiving from a JSON-RPC node.
#[derive(Parser)]
#[command(version = block_ingest::version(), propagate_version = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Follows the chain and feeds every block to the bundled indexers.
    Index {
        #[clap(flatten)]
        rpc: RpcArgs,
        #[clap(flatten)]
        looping: LoopArgs,
        /// SQLite block cache.
        #[arg(long, env = "BLOCK_INGEST_STORE_PATH", default_value = "blocks.db", value_hint = ValueHint::FilePath)]
        store_path: PathBuf,
        /// SQLite database holding the checkpoint and indexer tables.
        #[arg(long, env = "BLOCK_INGEST_INDEX_PATH", default_value = "index.db", value_hint = ValueHint::FilePath)]
        index_path: PathBuf,
    },
    /// Follows the chain and appends every block to a segment archive.
    Archive {
        #[clap(flatten)]
        rpc: RpcArgs,
        #[clap(flatten)]
        looping: LoopArgs,
        #[arg(long, env = "BLOCK_INGEST_ARCHIVE_DIR", value_hint = ValueHint::DirPath)]
        archive_dir: PathBuf,
        /// Size in MiB at which the open segment is sealed.
        #[arg(long, env = "BLOCK_INGEST_SEGMENT_SIZE_MB", default_value_t = 64)]
        segment_size_mb: u64,
        /// First block of an empty archive.
        #[arg(long, env = "BLOCK_INGEST_FIRST_BLOCK", default_value_t = 0)]
        first_block: u64,
    },
    /// Replays the archive into JSON lines files, following the tip.
    Export {
        #[arg(long, env = "BLOCK_INGEST_ARCHIVE_DIR", value_hint = ValueHint::DirPath)]
        archive_dir: PathBuf,
        #[arg(long, env = "BLOCK_INGEST_OUTPUT_DIR", value_hint = ValueHint::DirPath)]
        output_dir: PathBuf,
        /// Buffered rows at which reading pauses.
        #[arg(long, env = "BLOCK_INGEST_HIGH_WATERMARK", default_value_t = 100_000)]
        high_watermark: usize,
        /// Buffered rows at which reading resumes.
        #[arg(long, env = "BLOCK_INGEST_LOW_WATERMARK", default_value_t = 20_000)]
        low_watermark: usize,
        /// Seconds between flushes of every destination.
        #[arg(long, env = "BLOCK_INGEST_FLUSH_INTERVAL", default_value_t = 10)]
        flush_interval: u64,
        /// Seconds without new blocks after which the export stops.
        #[arg(long, env = "BLOCK_INGEST_TAIL_TIMEOUT", default_value_t = 30)]
        tail_timeout: u64,
        /// First block when no destination has committed anything.
        #[arg(long, env = "BLOCK_INGEST_FIRST_BLOCK", default_value_t = 0)]
        first_block: u64,
    },
    /// Prints indexer health as JSON. Safe to run next to `index`.
    Status {
        #[arg(long, env = "BLOCK_INGEST_INDEX_PATH", default_value = "index.db", value_hint = ValueHint::FilePath)]
        index_path: PathBuf,
        /// Also query the node for its identity and head.
        #[arg(long, env = "BLOCK_INGEST_RPC_URL", value_hint = ValueHint::Url)]
        rpc_url: Option<Url>,
        #[arg(long, env = "BLOCK_INGEST_CHAIN_IDENTITY", value_enum, default_value_t)]
        chain_identity: ChainIdentity,
    },
    /// Resolves a transaction or block hash from the index.
    Lookup {
        #[arg(long, env = "BLOCK_INGEST_STORE_PATH", default_value = "blocks.db", value_hint = ValueHint::FilePath)]
        store_path: PathBuf,
        #[arg(long, env = "BLOCK_INGEST_INDEX_PATH", default_value = "index.db", value_hint = ValueHint::FilePath)]
        index_path: PathBuf,
        #[command(subcommand)]
        target: LookupTarget,
    },
}

#[derive(Subcommand)]
pub(crate) enum LookupTarget {
    Tx { hash: B256 },
    Block { hash: B256 },
}

#[derive(Args)]
pub(crate) struct RpcArgs {
    /// The node RPC URL.
    #[arg(short = 'u', long, env = "BLOCK_INGEST_RPC_URL", help_heading = RPC_HELP_HEADING, value_hint = ValueHint::Url)]
    pub(crate) rpc_url: Url,
    /// Request timeout in seconds.
    #[arg(long, env = "BLOCK_INGEST_RPC_TIMEOUT", help_heading = RPC_HELP_HEADING, default_value_t = 30)]
    pub(crate) rpc_timeout: u64,
    #[arg(long, env = "BLOCK_INGEST_MAX_BATCH_SIZE", help_heading = RPC_HELP_HEADING, default_value_t = 400)]
    pub(crate) max_batch_size: usize,
    /// Wire requests allowed in flight at once.
    #[arg(long, env = "BLOCK_INGEST_MAX_CONCURRENCY", help_heading = RPC_HELP_HEADING, default_value_t = 10)]
    pub(crate) max_concurrency: usize,
    /// Wire requests started per second; 0 disables the limit.
    #[arg(long, env = "BLOCK_INGEST_MAX_RPS", help_heading = RPC_HELP_HEADING, default_value_t = 10)]
    pub(crate) max_requests_per_second: usize,
    #[arg(long, env = "BLOCK_INGEST_CHAIN_IDENTITY", help_heading = RPC_HELP_HEADING, value_enum, default_value_t)]
    pub(crate) chain_identity: ChainIdentity,
    /// Refuse to start unless the node reports this identity.
    #[arg(long, env = "BLOCK_INGEST_EXPECTED_CHAIN", help_heading = RPC_HELP_HEADING)]
    pub(crate) expected_chain: Option<String>,
}

impl RpcArgs {
    pub(crate) fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_concurrency: self.max_concurrency,
            max_requests_per_second: self.max_requests_per_second,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }
}

#[derive(Args)]
pub(crate) struct LoopArgs {
    /// Blocks fetched and committed together.
    #[arg(long, env = "BLOCK_INGEST_BLOCKS_PER_BATCH", help_heading = LOOP_HELP_HEADING, default_value_t = 100)]
    pub(crate) blocks_per_batch: u64,
    /// Seconds between head checks once caught up.
    #[arg(long, env = "BLOCK_INGEST_POLL_INTERVAL", help_heading = LOOP_HELP_HEADING, default_value_t = 20)]
    pub(crate) poll_interval: u64,
    /// Seconds to wait before retrying after a transient error.
    #[arg(long, env = "BLOCK_INGEST_ERROR_BACKOFF", help_heading = LOOP_HELP_HEADING, default_value_t = 5)]
    pub(crate) error_backoff: u64,
}

impl From<LoopArgs> for LoopConfig {
    fn from(args: LoopArgs) -> Self {
        Self {
            blocks_per_batch: args.blocks_per_batch,
            poll_interval: Duration::from_secs(args.poll_interval),
            error_backoff: Duration::from_secs(args.error_backoff),
            ..Default::default()
        }
    }
}
