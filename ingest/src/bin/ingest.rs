use anyhow::Result;
use block_ingest::env::load_dotenvy_vars_if_present;
use clap::Parser as _;
use ingest::cli::{Cli, Command};
use tracing::info;

mod ingest {
    pub mod cli;
    pub mod commands;
}

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenvy_vars_if_present();
    block_ingest::tracing::init();
    info!(version = %block_ingest::version(), "starting");

    let args = Cli::parse();
    match args.command {
        Command::Index {
            rpc,
            looping,
            store_path,
            index_path,
        } => ingest::commands::index(rpc, looping.into(), store_path, index_path).await,
        Command::Archive {
            rpc,
            looping,
            archive_dir,
            segment_size_mb,
            first_block,
        } => {
            ingest::commands::archive(rpc, looping.into(), archive_dir, segment_size_mb, first_block)
                .await
        }
        Command::Export {
            archive_dir,
            output_dir,
            high_watermark,
            low_watermark,
            flush_interval,
            tail_timeout,
            first_block,
        } => {
            ingest::commands::export(ingest::commands::ExportOptions {
                archive_dir,
                output_dir,
                high_watermark,
                low_watermark,
                flush_interval,
                tail_timeout,
                first_block,
            })
            .await
        }
        Command::Status {
            index_path,
            rpc_url,
            chain_identity,
        } => ingest::commands::status(index_path, rpc_url, chain_identity).await,
        Command::Lookup {
            store_path,
            index_path,
            target,
        } => ingest::commands::lookup(store_path, index_path, target).await,
    }
}
