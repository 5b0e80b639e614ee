use std::collections::BTreeMap;

use alloy::primitives::{BlockHash, TxHash};
use serde::ser::SerializeStruct as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Block header fields the pipeline relies on, plus the full list of
/// transaction objects.
///
/// Every other field returned by the node is kept in `other` so that a stored
/// block reproduces the upstream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(with = "crate::quantity")]
    pub number: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    #[serde(with = "crate::quantity")]
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Block {
    pub fn new(
        number: u64,
        hash: BlockHash,
        parent_hash: BlockHash,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            timestamp,
            transactions,
            other: Map::new(),
        }
    }

    pub fn transaction_hashes(&self) -> impl Iterator<Item = TxHash> + '_ {
        self.transactions.iter().map(|tx| tx.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: TxHash,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Transaction {
    pub fn new(hash: TxHash) -> Self {
        Self {
            hash,
            other: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: TxHash,
    #[serde(with = "crate::quantity")]
    pub block_number: u64,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Receipt {
    pub fn new(transaction_hash: TxHash, block_number: u64) -> Self {
        Self {
            transaction_hash,
            block_number,
            other: Map::new(),
        }
    }

    /// `Some(true)` when the node reports the transaction as executed
    /// successfully; `None` for pre-Byzantium receipts without a status.
    pub fn succeeded(&self) -> Option<bool> {
        let status = self.other.get("status")?.as_str()?;
        crate::quantity::parse(status).ok().map(|status| status == 1)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("block {block_number} has {transactions} transactions but {receipts} receipts")]
    ReceiptCountMismatch {
        block_number: u64,
        transactions: usize,
        receipts: usize,
    },
    #[error("block {block_number} has no receipt for transaction {tx_hash}")]
    MissingReceipt { block_number: u64, tx_hash: TxHash },
    #[error("block {block_number} has more than one receipt for transaction {tx_hash}")]
    DuplicateReceipt { block_number: u64, tx_hash: TxHash },
}

/// A block together with one receipt per transaction.
///
/// The only way to obtain one, including deserialization, goes through
/// [`StoredBlock::new`], so holding a value means the receipt set matches the
/// transaction list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStoredBlock")]
pub struct StoredBlock {
    block: Block,
    receipts: BTreeMap<TxHash, Receipt>,
}

#[derive(Deserialize)]
struct RawStoredBlock {
    block: Block,
    receipts: Vec<Receipt>,
}

impl TryFrom<RawStoredBlock> for StoredBlock {
    type Error = IntegrityError;

    fn try_from(raw: RawStoredBlock) -> Result<Self, Self::Error> {
        StoredBlock::new(raw.block, raw.receipts)
    }
}

impl StoredBlock {
    pub fn new(
        block: Block,
        receipts: impl IntoIterator<Item = Receipt>,
    ) -> Result<Self, IntegrityError> {
        let block_number = block.number;
        let mut by_hash = BTreeMap::new();
        for receipt in receipts {
            let tx_hash = receipt.transaction_hash;
            if by_hash.insert(tx_hash, receipt).is_some() {
                return Err(IntegrityError::DuplicateReceipt {
                    block_number,
                    tx_hash,
                });
            }
        }

        if by_hash.len() != block.transactions.len() {
            return Err(IntegrityError::ReceiptCountMismatch {
                block_number,
                transactions: block.transactions.len(),
                receipts: by_hash.len(),
            });
        }
        if let Some(tx_hash) = block.transaction_hashes().find(|h| !by_hash.contains_key(h)) {
            return Err(IntegrityError::MissingReceipt {
                block_number,
                tx_hash,
            });
        }

        Ok(Self {
            block,
            receipts: by_hash,
        })
    }

    pub fn number(&self) -> u64 {
        self.block.number
    }

    pub fn hash(&self) -> BlockHash {
        self.block.hash
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn receipts(&self) -> &BTreeMap<TxHash, Receipt> {
        &self.receipts
    }

    pub fn receipt(&self, tx_hash: &TxHash) -> Option<&Receipt> {
        self.receipts.get(tx_hash)
    }

    /// Transactions paired with their receipts, in block order.
    pub fn transactions_with_receipts(&self) -> impl Iterator<Item = (&Transaction, &Receipt)> {
        self.block
            .transactions
            .iter()
            .filter_map(|tx| self.receipts.get(&tx.hash).map(|r| (tx, r)))
    }

    pub fn into_parts(self) -> (Block, BTreeMap<TxHash, Receipt>) {
        (self.block, self.receipts)
    }
}

// Receipts are written as a list in transaction order; the map is rebuilt
// (and re-validated) on the way back in.
impl Serialize for StoredBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct InBlockOrder<'a>(&'a StoredBlock);

        impl Serialize for InBlockOrder<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_seq(self.0.transactions_with_receipts().map(|(_, r)| r))
            }
        }

        let mut state = serializer.serialize_struct("StoredBlock", 2)?;
        state.serialize_field("block", &self.block)?;
        state.serialize_field("receipts", &InBlockOrder(self))?;
        state.end()
    }
}
