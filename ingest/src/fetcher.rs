use std::sync::Arc;

use block_ingest_common::{Block, IntegrityError, Receipt, StoredBlock, TxHash};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rpc::{decode, BatchRpc, RpcCall, RpcError, RpcOperation, RpcTransport};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("node answered block {returned} when asked for block {requested}")]
    WrongBlock { requested: u64, returned: u64 },
    #[error("block {number} does not have the expected shape: {source}")]
    BlockDecode { number: u64, source: RpcError },
    #[error("receipt for transaction {tx_hash} of block {number} is unavailable: {source}")]
    ReceiptUnavailable {
        number: u64,
        tx_hash: TxHash,
        source: RpcError,
    },
    #[error("node has no receipt for transaction {tx_hash} of block {number}")]
    ReceiptMissing { number: u64, tx_hash: TxHash },
    #[error(
        "asked for the receipt of transaction {tx_hash} in block {number}, \
         node answered transaction {returned_tx} in block {returned_block}"
    )]
    ReceiptMismatch {
        number: u64,
        tx_hash: TxHash,
        returned_block: u64,
        returned_tx: TxHash,
    },
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl FetchError {
    /// Receipt requests that failed on the way to the node may succeed on a
    /// later attempt. Everything else means the node served inconsistent data.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::ReceiptUnavailable { source, .. } => !source.is_integrity(),
            _ => false,
        }
    }
}

/// Assembles [`StoredBlock`]s in two fan-out stages: the blocks with their
/// transactions, then one receipt per transaction.
pub struct BlockFetcher<T> {
    rpc: Arc<BatchRpc<T>>,
}

impl<T> Clone for BlockFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            rpc: self.rpc.clone(),
        }
    }
}

impl<T: RpcTransport> BlockFetcher<T> {
    pub fn new(rpc: Arc<BatchRpc<T>>) -> Self {
        Self { rpc }
    }

    pub fn rpc(&self) -> &Arc<BatchRpc<T>> {
        &self.rpc
    }

    /// Fetches the given block numbers.
    ///
    /// A block the node does not return (null result or per-call error) is
    /// left out of the result. Once a block is returned, failing to obtain any
    /// of its receipts is an error for the whole call.
    pub async fn fetch_range(&self, numbers: &[u64]) -> Result<Vec<StoredBlock>, FetchError> {
        let blocks = self.fetch_blocks(numbers).await?;
        let receipts = self.fetch_receipts(&blocks).await?;

        let stored = blocks
            .into_iter()
            .zip(receipts)
            .map(|(block, receipts)| StoredBlock::new(block, receipts))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            requested = numbers.len(),
            fetched = stored.len(),
            "fetched blocks"
        );
        Ok(stored)
    }

    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<Vec<Block>, FetchError> {
        let operations = numbers
            .iter()
            .map(|&number| {
                RpcOperation::new(
                    RpcCall::BlockByNumber {
                        number,
                        full_transactions: true,
                    },
                    number,
                )
            })
            .collect();

        let mut blocks = Vec::with_capacity(numbers.len());
        for outcome in self.rpc.submit(operations).await {
            let number = outcome.token;
            match outcome.result {
                Ok(Value::Null) => debug!(block_number = number, "node does not have block yet"),
                Ok(value) => {
                    let block: Block = decode("eth_getBlockByNumber", value)
                        .map_err(|source| FetchError::BlockDecode { number, source })?;
                    if block.number != number {
                        return Err(FetchError::WrongBlock {
                            requested: number,
                            returned: block.number,
                        });
                    }
                    blocks.push(block);
                }
                Err(e) => warn!(block_number = number, "failed to fetch block: {e}"),
            }
        }
        Ok(blocks)
    }

    async fn fetch_receipts(&self, blocks: &[Block]) -> Result<Vec<Vec<Receipt>>, FetchError> {
        let operations = blocks
            .iter()
            .enumerate()
            .flat_map(|(index, block)| {
                block.transactions.iter().map(move |tx| {
                    RpcOperation::new(
                        RpcCall::TransactionReceipt { hash: tx.hash },
                        (index, block.number, tx.hash),
                    )
                })
            })
            .collect::<Vec<_>>();

        let mut receipts = blocks
            .iter()
            .map(|block| Vec::with_capacity(block.transactions.len()))
            .collect::<Vec<Vec<Receipt>>>();
        for outcome in self.rpc.submit(operations).await {
            let (index, number, tx_hash) = outcome.token;
            let unavailable = |source| FetchError::ReceiptUnavailable {
                number,
                tx_hash,
                source,
            };
            let value = outcome.result.map_err(unavailable)?;
            if value.is_null() {
                return Err(FetchError::ReceiptMissing { number, tx_hash });
            }
            let receipt: Receipt =
                decode("eth_getTransactionReceipt", value).map_err(unavailable)?;
            // A node that reorged between the two stages answers for a block
            // other than the one being assembled.
            if receipt.block_number != number || receipt.transaction_hash != tx_hash {
                return Err(FetchError::ReceiptMismatch {
                    number,
                    tx_hash,
                    returned_block: receipt.block_number,
                    returned_tx: receipt.transaction_hash,
                });
            }
            if let Some(slot) = receipts.get_mut(index) {
                slot.push(receipt);
            }
        }
        Ok(receipts)
    }
}
