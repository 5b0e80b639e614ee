//! Chain data shared by the ingestion crates: blocks with their full
//! transaction list, receipts, and the [`StoredBlock`] pairing that every
//! store and indexer works with.

mod block;
pub mod quantity;

pub use alloy::primitives::{BlockHash, TxHash, B256};
pub use block::{Block, IntegrityError, Receipt, StoredBlock, Transaction};

/// Number of leading hash bytes kept by the compact hash lookup tables.
pub const STORE_HASH_BYTES: usize = 5;

/// Returns the prefix of `hash` used as a lookup key.
pub fn hash_prefix(hash: &B256) -> &[u8] {
    &hash.as_slice()[..STORE_HASH_BYTES]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_keeps_the_leading_bytes() {
        let hash = B256::from_slice(&(0u8..32).collect::<Vec<_>>());
        assert_eq!(hash_prefix(&hash), &[0, 1, 2, 3, 4]);
        assert_eq!(hash_prefix(&hash).len(), STORE_HASH_BYTES);
    }
}
