pub mod archive;
pub mod env;
pub mod error;
pub mod fetcher;
pub mod index;
pub mod indexing_loop;
pub mod provider;
pub mod rpc;
pub mod sink;
pub mod store;
pub mod tracing;
pub mod window;

/// Common information for the `--version` CLI flags.
pub fn version() -> String {
    let pkg_name = env!("CARGO_PKG_NAME");
    let pkg_version = env!("CARGO_PKG_VERSION");
    format!("{pkg_name} {pkg_version}")
}
