//! JSON-RPC client that coalesces logical calls into batched wire requests.
//!
//! Callers build [`RpcOperation`]s from the closed set of [`RpcCall`]s this
//! crate needs, hand them to [`BatchRpc::submit`] and get one [`RpcOutcome`]
//! back per operation, in input order, carrying the caller's token. Wire ids
//! are batch-local and never leave this module.

use alloy::primitives::{Address, Bytes};
use block_ingest_common::{quantity, TxHash};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

mod batcher;
mod identity;
mod limiter;
mod queue;
mod stats;
mod transport;
mod wire;

pub use batcher::{BatchConfig, BatchRpc};
pub use identity::ChainIdentity;
pub use limiter::RateLimiter;
pub use queue::BatchQueue;
pub use stats::{RpcStats, StatsSnapshot};
pub use transport::{HttpTransport, RpcTransport};

/// The remote calls issued by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCall {
    /// `eth_getBlockByNumber`; `full_transactions` selects transaction objects
    /// over hashes.
    BlockByNumber {
        number: u64,
        full_transactions: bool,
    },
    /// `eth_getTransactionReceipt`
    TransactionReceipt { hash: TxHash },
    /// `eth_blockNumber`
    BlockNumber,
    /// `eth_chainId`
    ChainId,
    /// `eth_call` against the latest block.
    Call { to: Address, data: Bytes },
}

impl RpcCall {
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::BlockByNumber { .. } => "eth_getBlockByNumber",
            RpcCall::TransactionReceipt { .. } => "eth_getTransactionReceipt",
            RpcCall::BlockNumber => "eth_blockNumber",
            RpcCall::ChainId => "eth_chainId",
            RpcCall::Call { .. } => "eth_call",
        }
    }

    pub fn params(&self) -> Vec<Value> {
        match self {
            RpcCall::BlockByNumber {
                number,
                full_transactions,
            } => vec![json!(quantity::to_hex(*number)), json!(full_transactions)],
            RpcCall::TransactionReceipt { hash } => vec![json!(hash)],
            RpcCall::BlockNumber | RpcCall::ChainId => vec![],
            RpcCall::Call { to, data } => vec![json!({ "to": to, "data": data }), json!("latest")],
        }
    }
}

/// One logical call plus the caller's correlation token. The token is only
/// moved back into the matching [`RpcOutcome`].
#[derive(Debug)]
pub struct RpcOperation<T> {
    pub call: RpcCall,
    pub token: T,
}

impl<T> RpcOperation<T> {
    pub fn new(call: RpcCall, token: T) -> Self {
        Self { call, token }
    }
}

#[derive(Debug)]
pub struct RpcOutcome<T> {
    pub token: T,
    pub result: Result<Value, RpcError>,
}

/// The wire call as a whole failed. Every operation of the affected batch
/// receives a clone of the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("request to {url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("malformed JSON-RPC response: {0}")]
    Malformed(String),
    #[error("rpc client has shut down")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rpc error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("no response for operation at batch-local index {index}")]
    MissingResponse { index: usize },
    #[error("batch-local id {id} answered more than once")]
    IdCollision { id: u64 },
    #[error("could not decode {method} result: {message}")]
    Decode {
        method: &'static str,
        message: String,
    },
}

impl RpcError {
    /// True when the node or local state is inconsistent rather than
    /// temporarily unreachable.
    pub fn is_integrity(&self) -> bool {
        matches!(self, RpcError::IdCollision { .. } | RpcError::Decode { .. })
    }
}

/// Decodes a result value into the typed shape expected for `method`,
/// reporting the path of the first offending field.
pub fn decode<D: DeserializeOwned>(method: &'static str, value: Value) -> Result<D, RpcError> {
    serde_path_to_error::deserialize(value).map_err(|e| RpcError::Decode {
        method,
        message: format!("{} (at `{}`)", e.inner(), e.path()),
    })
}

/// Decodes a hex quantity result such as the one returned by
/// `eth_blockNumber`.
pub fn decode_quantity(method: &'static str, value: Value) -> Result<u64, RpcError> {
    let raw: String = decode(method, value)?;
    quantity::parse(&raw).map_err(|message| RpcError::Decode { method, message })
}
