mod common;

use block_ingest::fetcher::{BlockFetcher, FetchError};
use block_ingest::rpc::ChainIdentity;
use common::{tx_hash, FakeNode, CHAIN_ID};

#[tokio::test]
async fn fetches_blocks_with_their_receipts() {
    let node = FakeNode::with_blocks(0..=10, 2);
    let fetcher = BlockFetcher::new(node.rpc());

    let blocks = fetcher.fetch_range(&[3, 4, 5]).await.unwrap();

    assert_eq!(blocks, vec![node.block(3), node.block(4), node.block(5)]);
    assert!(blocks
        .iter()
        .flat_map(|b| b.transactions_with_receipts())
        .all(|(_, receipt)| receipt.succeeded() == Some(true)));
    assert_eq!(node.calls("eth_getBlockByNumber"), 3);
    assert_eq!(node.calls("eth_getTransactionReceipt"), 6);
}

#[tokio::test]
async fn leaves_out_blocks_the_node_does_not_have() {
    let node = FakeNode::with_blocks(0..=10, 1);
    node.withhold_block(4);
    let fetcher = BlockFetcher::new(node.rpc());

    let numbers = fetcher
        .fetch_range(&[3, 4, 5, 11, 12])
        .await
        .unwrap()
        .iter()
        .map(|b| b.number())
        .collect::<Vec<_>>();

    assert_eq!(numbers, vec![3, 5]);
}

#[tokio::test]
async fn a_block_request_failure_only_drops_blocks() {
    let node = FakeNode::with_blocks(0..=10, 1);
    node.fail_method("eth_getBlockByNumber");
    let fetcher = BlockFetcher::new(node.rpc());

    assert!(fetcher.fetch_range(&[1, 2]).await.unwrap().is_empty());
}

#[tokio::test]
async fn a_missing_receipt_fails_the_whole_call() {
    let node = FakeNode::with_blocks(0..=10, 3);
    node.withhold_receipt(tx_hash(6, 1));
    let fetcher = BlockFetcher::new(node.rpc());

    let err = fetcher.fetch_range(&[5, 6, 7]).await.unwrap_err();

    assert!(
        matches!(err, FetchError::ReceiptMissing { number: 6, tx_hash: hash } if hash == tx_hash(6, 1)),
        "{err}"
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn an_unreachable_receipt_is_retryable() {
    let node = FakeNode::with_blocks(0..=10, 1);
    node.fail_method("eth_getTransactionReceipt");
    let fetcher = BlockFetcher::new(node.rpc());

    let err = fetcher.fetch_range(&[1]).await.unwrap_err();

    assert!(matches!(err, FetchError::ReceiptUnavailable { number: 1, .. }), "{err}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn rejects_a_block_served_under_the_wrong_number() {
    let node = FakeNode::with_blocks(0..=10, 0);
    node.misnumber(4, 7);
    let fetcher = BlockFetcher::new(node.rpc());

    let err = fetcher.fetch_range(&[4]).await.unwrap_err();

    assert!(matches!(
        err,
        FetchError::WrongBlock {
            requested: 4,
            returned: 7
        }
    ));
}

#[tokio::test]
async fn rejects_a_receipt_from_another_block() {
    let node = FakeNode::with_blocks(0..=10, 2);
    node.relocate_receipt(tx_hash(5, 1), 9);
    let fetcher = BlockFetcher::new(node.rpc());

    let err = fetcher.fetch_range(&[4, 5]).await.unwrap_err();

    assert!(
        matches!(
            err,
            FetchError::ReceiptMismatch { number: 5, returned_block: 9, tx_hash: hash, .. }
                if hash == tx_hash(5, 1)
        ),
        "{err}"
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn identifies_the_chain() {
    let node = FakeNode::with_blocks(0..=0, 0);
    let rpc = node.rpc();

    assert_eq!(
        ChainIdentity::ChainId.identify(&rpc).await.unwrap(),
        CHAIN_ID.to_string()
    );
    assert_eq!(
        ChainIdentity::WarpPrecompile.identify(&rpc).await.unwrap(),
        format!("0x{}", "ab".repeat(32))
    );
    assert_eq!(rpc.block_number().await.unwrap(), 0);
}
