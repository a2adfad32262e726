use alloy::primitives::B256;

use crate::rpc::types::RpcReceipt;
use crate::rpc::{RpcClient, RpcError};

pub const BLOCK_RECEIPTS_METHOD: &str = "eth_getBlockReceipts";
pub const TX_RECEIPT_METHOD: &str = "eth_getTransactionReceipt";

/// Receipts of one block, tagged with the method that produced them so row
/// mapping errors name the right call.
#[derive(Debug)]
pub struct BlockReceipts {
    pub method: &'static str,
    pub receipts: Vec<RpcReceipt>,
}

/// Fetch every receipt of a block.
///
/// Uses `eth_getBlockReceipts` when the endpoint supports it and falls back to
/// one `eth_getTransactionReceipt` per transaction otherwise. Pacing between
/// the per-transaction calls is left to the client's QPS gate.
pub async fn fetch_block_receipts(
    client: &RpcClient,
    block_hash: B256,
    tx_hashes: &[B256],
) -> Result<BlockReceipts, RpcError> {
    if tx_hashes.is_empty() {
        return Ok(BlockReceipts {
            method: BLOCK_RECEIPTS_METHOD,
            receipts: Vec::new(),
        });
    }

    if let Some(receipts) = client.get_block_receipts(block_hash).await? {
        return Ok(BlockReceipts {
            method: BLOCK_RECEIPTS_METHOD,
            receipts,
        });
    }

    let mut receipts = Vec::with_capacity(tx_hashes.len());
    for hash in tx_hashes {
        receipts.push(client.get_transaction_receipt(*hash).await?);
    }

    Ok(BlockReceipts {
        method: TX_RECEIPT_METHOD,
        receipts,
    })
}
