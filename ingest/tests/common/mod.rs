//! An in-memory node speaking batched JSON-RPC, with knobs to make it
//! misbehave.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use block_ingest::rpc::{BatchConfig, BatchRpc, RpcTransport, TransportError};
use block_ingest_common::{quantity, Block, Receipt, StoredBlock, Transaction, TxHash, B256};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const CHAIN_ID: u64 = 43114;

/// Block hashes start with `0xb0`, transaction hashes with `0x70`. The
/// remaining bytes encode the block number and transaction index.
pub fn block_hash(number: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xb0;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

pub fn tx_hash(number: u64, index: u32) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x70;
    bytes[20..28].copy_from_slice(&number.to_be_bytes());
    bytes[28..].copy_from_slice(&index.to_be_bytes());
    B256::from(bytes)
}

/// Block `number` with `tx_count` successful transactions.
pub fn make_block(number: u64, tx_count: u32) -> StoredBlock {
    let transactions = (0..tx_count)
        .map(|index| Transaction::new(tx_hash(number, index)))
        .collect();
    let block = Block::new(
        number,
        block_hash(number),
        block_hash(number.wrapping_sub(1)),
        1_700_000_000 + number,
        transactions,
    );
    let receipts = (0..tx_count).map(|index| {
        let mut receipt = Receipt::new(tx_hash(number, index), number);
        receipt.other.insert("status".into(), json!("0x1"));
        receipt
    });
    StoredBlock::new(block, receipts).expect("receipts match transactions")
}

#[derive(Default)]
struct Chain {
    blocks: BTreeMap<u64, StoredBlock>,
    head: u64,
    calls: HashMap<String, usize>,
    wire_requests: usize,
    withheld_blocks: HashSet<u64>,
    withheld_receipts: HashSet<TxHash>,
    failing_methods: HashSet<String>,
    misnumbered: HashMap<u64, u64>,
    relocated_receipts: HashMap<TxHash, u64>,
}

#[derive(Default)]
pub struct FakeNode {
    chain: Mutex<Chain>,
}

impl FakeNode {
    /// Blocks `range` with `tx_count` transactions each, head at the last one.
    pub fn with_blocks(range: std::ops::RangeInclusive<u64>, tx_count: u32) -> Arc<Self> {
        let node = Self::default();
        {
            let mut chain = node.chain.lock();
            chain.head = *range.end();
            for number in range {
                chain.blocks.insert(number, make_block(number, tx_count));
            }
        }
        Arc::new(node)
    }

    pub fn rpc(self: &Arc<Self>) -> Arc<BatchRpc<Arc<FakeNode>>> {
        Arc::new(BatchRpc::new(
            self.clone(),
            BatchConfig {
                max_batch_size: 50,
                max_concurrency: 4,
                max_requests_per_second: 0,
            },
        ))
    }

    pub fn block(&self, number: u64) -> StoredBlock {
        self.chain.lock().blocks[&number].clone()
    }

    /// Appends blocks up to `head` and moves the head there.
    pub fn grow_to(&self, head: u64, tx_count: u32) {
        let mut chain = self.chain.lock();
        for number in chain.head + 1..=head {
            chain.blocks.insert(number, make_block(number, tx_count));
        }
        chain.head = head;
    }

    /// Answers `null` for this block until released.
    pub fn withhold_block(&self, number: u64) {
        self.chain.lock().withheld_blocks.insert(number);
    }

    pub fn release_block(&self, number: u64) {
        self.chain.lock().withheld_blocks.remove(&number);
    }

    /// Answers `null` for this receipt.
    pub fn withhold_receipt(&self, hash: TxHash) {
        self.chain.lock().withheld_receipts.insert(hash);
    }

    /// Fails every wire request that contains `method` with HTTP 503.
    pub fn fail_method(&self, method: &str) {
        self.chain.lock().failing_methods.insert(method.to_string());
    }

    /// Serves block `served` when asked for `requested`.
    pub fn misnumber(&self, requested: u64, served: u64) {
        self.chain.lock().misnumbered.insert(requested, served);
    }

    /// Serves the receipt of `hash` as if it had been mined in `block`.
    pub fn relocate_receipt(&self, hash: TxHash, block: u64) {
        self.chain.lock().relocated_receipts.insert(hash, block);
    }

    /// Calls of `method` received so far, across all wire requests.
    pub fn calls(&self, method: &str) -> usize {
        self.chain.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn wire_requests(&self) -> usize {
        self.chain.lock().wire_requests
    }

    fn answer(chain: &Chain, method: &str, params: &[Value]) -> Result<Value, Value> {
        match method {
            "eth_blockNumber" => Ok(json!(quantity::to_hex(chain.head))),
            "eth_chainId" => Ok(json!(quantity::to_hex(CHAIN_ID))),
            "eth_call" => Ok(json!(format!("0x{}", "ab".repeat(32)))),
            "eth_getBlockByNumber" => {
                let number = params
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| quantity::parse(s).ok())
                    .ok_or_else(|| json!({ "code": -32602, "message": "invalid block number" }))?;
                if number > chain.head || chain.withheld_blocks.contains(&number) {
                    return Ok(Value::Null);
                }
                let served = chain.misnumbered.get(&number).copied().unwrap_or(number);
                Ok(chain
                    .blocks
                    .get(&served)
                    .map(|stored| json!(stored.block()))
                    .unwrap_or(Value::Null))
            }
            "eth_getTransactionReceipt" => {
                let hash: TxHash = params
                    .first()
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .ok_or_else(|| json!({ "code": -32602, "message": "invalid hash" }))?;
                if chain.withheld_receipts.contains(&hash) {
                    return Ok(Value::Null);
                }
                Ok(chain
                    .blocks
                    .values()
                    .find_map(|stored| stored.receipt(&hash))
                    .map(|receipt| {
                        let mut receipt = receipt.clone();
                        if let Some(block) = chain.relocated_receipts.get(&hash) {
                            receipt.block_number = *block;
                        }
                        json!(receipt)
                    })
                    .unwrap_or(Value::Null))
            }
            other => Err(json!({ "code": -32601, "message": format!("{other} not supported") })),
        }
    }
}

impl RpcTransport for FakeNode {
    async fn send(&self, body: Value) -> Result<Value, TransportError> {
        let mut chain = self.chain.lock();
        chain.wire_requests += 1;

        let Value::Array(requests) = body else {
            return Err(TransportError::Malformed("expected a batch".into()));
        };
        let methods = requests
            .iter()
            .map(|request| request["method"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        for method in &methods {
            *chain.calls.entry(method.clone()).or_default() += 1;
        }
        if methods.iter().any(|m| chain.failing_methods.contains(m)) {
            return Err(TransportError::Status {
                url: "http://fake-node".into(),
                status: 503,
                body: "unavailable".into(),
            });
        }

        let responses = requests
            .iter()
            .zip(&methods)
            .map(|(request, method)| {
                let params = request["params"].as_array().cloned().unwrap_or_default();
                match Self::answer(&chain, method, &params) {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }),
                    Err(error) => json!({ "jsonrpc": "2.0", "id": request["id"], "error": error }),
                }
            })
            .collect();
        Ok(Value::Array(responses))
    }
}
