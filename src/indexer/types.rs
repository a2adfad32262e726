use alloy::primitives::Address;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

/// Net change to one holder's balance for one token within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderDelta {
    pub holder: Address,
    pub delta: BigDecimal,
}

/// A block header, ready for DB insertion.
#[derive(Debug, Clone)]
pub struct BlockRow {
    pub chain_id: i64,
    pub number: i64,
    pub hash: Vec<u8>,
    pub parent_hash: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub miner: Option<Vec<u8>>,
    pub gas_used: BigDecimal,
    pub gas_limit: BigDecimal,
    pub base_fee_per_gas: Option<BigDecimal>,
    pub tx_count: i32,
}

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub chain_id: i64,
    pub hash: Vec<u8>,
    pub block_number: i64,
    pub tx_index: i32,
    pub from_address: Vec<u8>,
    /// `None` for contract creations.
    pub to_address: Option<Vec<u8>>,
    pub value: BigDecimal,
    pub gas: BigDecimal,
    pub gas_price: Option<BigDecimal>,
    pub nonce: BigDecimal,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReceiptRow {
    pub chain_id: i64,
    pub tx_hash: Vec<u8>,
    pub block_number: i64,
    pub tx_index: i32,
    /// Pre-Byzantium receipts carry a state root instead of a status.
    pub status: Option<bool>,
    pub gas_used: BigDecimal,
    pub cumulative_gas_used: BigDecimal,
    pub effective_gas_price: Option<BigDecimal>,
    pub contract_address: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct LogRow {
    pub chain_id: i64,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
    pub block_number: i64,
    pub address: Vec<u8>,
    pub topic0: Option<Vec<u8>>,
    pub topic1: Option<Vec<u8>>,
    pub topic2: Option<Vec<u8>>,
    pub topic3: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

/// A decoded ERC-20 Transfer, ready for DB insertion.
#[derive(Debug, Clone)]
pub struct TokenTransferRow {
    pub chain_id: i64,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
    pub block_number: i64,
    pub token_address: Vec<u8>,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub value: BigDecimal,
}

/// Net deltas for one token produced by a batch.
#[derive(Debug, Clone)]
pub struct TokenDeltas {
    pub token: Address,
    pub deltas: Vec<HolderDelta>,
}

/// Everything one chain poller cycle writes, committed as a single transaction.
#[derive(Debug, Clone, Default)]
pub struct ChainBatch {
    pub chain_id: i64,
    pub from_block: u64,
    pub to_block: u64,
    pub blocks: Vec<BlockRow>,
    pub transactions: Vec<TransactionRow>,
    pub receipts: Vec<ReceiptRow>,
    pub logs: Vec<LogRow>,
    pub transfers: Vec<TokenTransferRow>,
    pub deltas: Vec<TokenDeltas>,
}

impl ChainBatch {
    pub fn row_count(&self) -> usize {
        self.blocks.len()
            + self.transactions.len()
            + self.receipts.len()
            + self.logs.len()
            + self.transfers.len()
    }
}

/// Which chain-wide job a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Live,
    Backfill,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Job::Live => "live",
            Job::Backfill => "backfill",
        }
    }
}

/// A row of `job_checkpoints`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Block the job started from, written once.
    pub first_block: u64,
    pub last_block: u64,
}

/// Progress marker of one `(chain, token)` pair tailed by the holders indexer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenCursor {
    pub chain_id: i64,
    pub token_address: Vec<u8>,
    /// Next block to scan.
    pub from_block: i64,
    /// Last block scanned. NULL until the first batch lands.
    pub to_block: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    Indexing,
    Synced,
}

impl CursorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorStatus::Indexing => "indexing",
            CursorStatus::Synced => "synced",
        }
    }
}

impl TokenCursor {
    pub fn token(&self) -> Option<Address> {
        (self.token_address.len() == 20).then(|| Address::from_slice(&self.token_address))
    }

    pub fn status(&self) -> CursorStatus {
        match self.to_block {
            None => CursorStatus::Indexing,
            Some(_) => CursorStatus::Synced,
        }
    }
}

/// Cursor move after scanning `[from, to]`. `expected_from` guards the update
/// against a reindex that reset the cursor while the batch was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorAdvance {
    pub expected_from: i64,
    pub from_block: i64,
    pub to_block: i64,
}

impl CursorAdvance {
    pub fn after_scan(from: u64, to: u64) -> Self {
        Self {
            expected_from: from as i64,
            from_block: to as i64 + 1,
            to_block: to as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advance_after_scan() {
        let advance = CursorAdvance::after_scan(100_000, 100_999);
        assert_eq!(advance.expected_from, 100_000);
        assert_eq!(advance.from_block, 101_000);
        assert_eq!(advance.to_block, 100_999);
    }

    #[test]
    fn test_cursor_status() {
        let mut cursor = TokenCursor {
            chain_id: 1,
            token_address: vec![0xaa; 20],
            from_block: 100_000,
            to_block: None,
            updated_at: Utc::now(),
        };
        assert_eq!(cursor.status(), CursorStatus::Indexing);
        assert_eq!(cursor.status().as_str(), "indexing");
        cursor.to_block = Some(100_999);
        assert_eq!(cursor.status().as_str(), "synced");
        assert_eq!(cursor.token(), Some(Address::repeat_byte(0xaa)));
    }
}
