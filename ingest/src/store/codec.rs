use std::io;

use block_ingest_common::StoredBlock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("zstd: {0}")]
    Compression(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes a block to JSON and compresses it with zstd at `level`.
pub fn encode_block(block: &StoredBlock, level: i32) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(block)?;
    Ok(zstd::bulk::compress(&json, level)?)
}

/// Inverse of [`encode_block`]. A payload that decodes into a block whose
/// receipts do not match its transactions is reported as a JSON error.
pub fn decode_block(data: &[u8]) -> Result<StoredBlock, CodecError> {
    let json = zstd::stream::decode_all(data)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use block_ingest_common::{Block, Receipt, Transaction, B256};

    use super::*;

    #[test]
    fn it_shrinks_repetitive_blocks() {
        let txs = (0..50u8)
            .map(|i| Transaction::new(B256::repeat_byte(i)))
            .collect::<Vec<_>>();
        let receipts = (0..50u8)
            .map(|i| Receipt::new(B256::repeat_byte(i), 9))
            .collect::<Vec<_>>();
        let block = StoredBlock::new(
            Block::new(9, B256::repeat_byte(9), B256::repeat_byte(8), 0, txs),
            receipts,
        )
        .unwrap();

        let encoded = encode_block(&block, 3).unwrap();
        assert!(encoded.len() < serde_json::to_vec(&block).unwrap().len() / 2);
        assert_eq!(decode_block(&encoded).unwrap(), block);
    }

    #[test]
    fn it_rejects_garbage() {
        assert!(matches!(
            decode_block(b"definitely not zstd"),
            Err(CodecError::Compression(_))
        ));
        let not_a_block = zstd::bulk::compress(br#"{"block": 1}"#, 1).unwrap();
        assert!(matches!(decode_block(&not_a_block), Err(CodecError::Json(_))));
    }
}
