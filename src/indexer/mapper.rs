use chrono::DateTime;

use super::decoder::{u256_to_decimal, DecodedTransfer};
use super::types::{BlockRow, LogRow, ReceiptRow, TokenTransferRow, TransactionRow};
use crate::rpc::hex;
use crate::rpc::types::{RpcBlock, RpcLog, RpcReceipt, RpcTransaction};
use crate::rpc::RpcError;

const BLOCK_METHOD: &str = "eth_getBlockByNumber";

fn decimal(method: &'static str, field: &'static str, raw: Option<&str>) -> Result<bigdecimal::BigDecimal, RpcError> {
    hex::require_u256(method, field, raw).map(u256_to_decimal)
}

fn optional_decimal(
    method: &'static str,
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<bigdecimal::BigDecimal>, RpcError> {
    Ok(hex::optional_u256(method, field, raw)?.map(u256_to_decimal))
}

/// Map a block fetched with full transactions into its header row and
/// transaction rows.
pub fn map_block(chain_id: i64, block: &RpcBlock) -> Result<(BlockRow, Vec<TransactionRow>), RpcError> {
    let number = hex::require_u64(BLOCK_METHOD, "number", block.number.as_deref())?;
    let hash = hex::require_b256(BLOCK_METHOD, "hash", block.hash.as_deref())?;
    let parent_hash = hex::require_b256(BLOCK_METHOD, "parentHash", block.parent_hash.as_deref())?;
    let seconds = hex::require_u64(BLOCK_METHOD, "timestamp", block.timestamp.as_deref())?;
    let timestamp = i64::try_from(seconds)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .ok_or_else(|| RpcError::InvalidHex {
            method: BLOCK_METHOD,
            field: "timestamp",
            raw: block.timestamp.clone(),
        })?;

    let transactions = block
        .transactions
        .iter()
        .map(|tx| map_transaction(chain_id, number, tx))
        .collect::<Result<Vec<_>, _>>()?;

    let row = BlockRow {
        chain_id,
        number: number as i64,
        hash: hash.to_vec(),
        parent_hash: parent_hash.to_vec(),
        timestamp,
        miner: hex::optional_address(BLOCK_METHOD, "miner", block.miner.as_deref())?
            .map(|a| a.to_vec()),
        gas_used: decimal(BLOCK_METHOD, "gasUsed", block.gas_used.as_deref())?,
        gas_limit: decimal(BLOCK_METHOD, "gasLimit", block.gas_limit.as_deref())?,
        base_fee_per_gas: optional_decimal(
            BLOCK_METHOD,
            "baseFeePerGas",
            block.base_fee_per_gas.as_deref(),
        )?,
        tx_count: transactions.len() as i32,
    };

    Ok((row, transactions))
}

fn map_transaction(
    chain_id: i64,
    block_number: u64,
    tx: &RpcTransaction,
) -> Result<TransactionRow, RpcError> {
    let hash = hex::require_b256(BLOCK_METHOD, "transactions.hash", tx.hash.as_deref())?;
    let tx_index = hex::require_u64(
        BLOCK_METHOD,
        "transactions.transactionIndex",
        tx.transaction_index.as_deref(),
    )?;

    Ok(TransactionRow {
        chain_id,
        hash: hash.to_vec(),
        block_number: block_number as i64,
        tx_index: tx_index as i32,
        from_address: hex::require_address(BLOCK_METHOD, "transactions.from", tx.from.as_deref())?
            .to_vec(),
        to_address: hex::optional_address(BLOCK_METHOD, "transactions.to", tx.to.as_deref())?
            .map(|a| a.to_vec()),
        value: decimal(BLOCK_METHOD, "transactions.value", tx.value.as_deref())?,
        gas: decimal(BLOCK_METHOD, "transactions.gas", tx.gas.as_deref())?,
        gas_price: optional_decimal(BLOCK_METHOD, "transactions.gasPrice", tx.gas_price.as_deref())?,
        nonce: decimal(BLOCK_METHOD, "transactions.nonce", tx.nonce.as_deref())?,
        input: hex::require_bytes(BLOCK_METHOD, "transactions.input", tx.input.as_deref())?,
    })
}

/// Map a receipt and the logs it carries. Logs flagged `removed` are dropped.
pub fn map_receipt(
    method: &'static str,
    chain_id: i64,
    receipt: &RpcReceipt,
) -> Result<(ReceiptRow, Vec<LogRow>), RpcError> {
    let tx_hash = hex::require_b256(method, "transactionHash", receipt.transaction_hash.as_deref())?;
    let block_number = hex::require_u64(method, "blockNumber", receipt.block_number.as_deref())?;
    let tx_index = hex::require_u64(method, "transactionIndex", receipt.transaction_index.as_deref())?;
    let status = match receipt.status.as_deref() {
        None => None,
        raw => Some(
            hex::parse_bool(raw).ok_or_else(|| RpcError::InvalidHex {
                method,
                field: "status",
                raw: receipt.status.clone(),
            })?,
        ),
    };

    let logs = receipt
        .logs
        .iter()
        .filter(|log| !log.is_removed())
        .map(|log| map_log(method, chain_id, log))
        .collect::<Result<Vec<_>, _>>()?;

    let row = ReceiptRow {
        chain_id,
        tx_hash: tx_hash.to_vec(),
        block_number: block_number as i64,
        tx_index: tx_index as i32,
        status,
        gas_used: decimal(method, "gasUsed", receipt.gas_used.as_deref())?,
        cumulative_gas_used: decimal(
            method,
            "cumulativeGasUsed",
            receipt.cumulative_gas_used.as_deref(),
        )?,
        effective_gas_price: optional_decimal(
            method,
            "effectiveGasPrice",
            receipt.effective_gas_price.as_deref(),
        )?,
        contract_address: hex::optional_address(
            method,
            "contractAddress",
            receipt.contract_address.as_deref(),
        )?
        .map(|a| a.to_vec()),
    };

    Ok((row, logs))
}

pub fn map_log(method: &'static str, chain_id: i64, log: &RpcLog) -> Result<LogRow, RpcError> {
    let mut topics = [None, None, None, None];
    for (slot, raw) in topics.iter_mut().zip(&log.topics) {
        *slot = Some(hex::require_b256(method, "topics", Some(raw.as_str()))?.to_vec());
    }
    let [topic0, topic1, topic2, topic3] = topics;

    Ok(LogRow {
        chain_id,
        tx_hash: hex::require_b256(method, "logs.transactionHash", log.transaction_hash.as_deref())?
            .to_vec(),
        log_index: hex::require_u64(method, "logs.logIndex", log.log_index.as_deref())? as i32,
        block_number: hex::require_u64(method, "logs.blockNumber", log.block_number.as_deref())?
            as i64,
        address: hex::require_address(method, "logs.address", log.address.as_deref())?.to_vec(),
        topic0,
        topic1,
        topic2,
        topic3,
        data: hex::require_bytes(method, "logs.data", log.data.as_deref())?,
    })
}

pub fn map_transfer(chain_id: i64, transfer: &DecodedTransfer) -> TokenTransferRow {
    TokenTransferRow {
        chain_id,
        tx_hash: transfer.tx_hash.to_vec(),
        log_index: transfer.log_index as i32,
        block_number: transfer.block_number as i64,
        token_address: transfer.token.to_vec(),
        from_address: transfer.from.to_vec(),
        to_address: transfer.to.to_vec(),
        value: u256_to_decimal(transfer.value),
    }
}
