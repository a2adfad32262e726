use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::{BigDecimal, Zero};
use std::collections::BTreeMap;
use thiserror::Error;

use super::types::HolderDelta;
use crate::rpc::hex;
use crate::rpc::types::RpcLog;

// Generate the Transfer event ABI using alloy's sol! macro.
// This gives us Transfer::SIGNATURE_HASH, the canonical topic0.
sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// The topic0 every ERC-20 `Transfer` log carries.
pub fn transfer_topic() -> B256 {
    Transfer::SIGNATURE_HASH
}

/// A balance engine must never invent amounts: an unreadable value is an error.
#[derive(Debug, Error)]
pub enum TransferDecodeError {
    #[error("invalid transfer value {raw:?} in tx {tx_hash:?} log {log_index:?}")]
    InvalidValue {
        tx_hash: Option<String>,
        log_index: Option<String>,
        raw: Option<String>,
    },
}

/// One decoded ERC-20 `Transfer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
}

fn is_transfer_log(log: &RpcLog) -> bool {
    // ERC-721 shares the signature but indexes the token id as a 4th topic
    // and carries no value in data.
    if log.topics.len() != 3 || log.is_removed() {
        return false;
    }
    hex::parse_b256(Some(log.topics[0].as_str())) == Some(Transfer::SIGNATURE_HASH)
}

/// Decode every ERC-20 `Transfer` in `logs`.
///
/// Logs with another topic0, fewer than three topics, or flagged `removed`
/// are skipped. Structural fields (addresses, tx hash, positions) that do not
/// parse surface as [`crate::rpc::RpcError::InvalidHex`] since they point at
/// a broken endpoint; a value that does not parse is a
/// [`TransferDecodeError::InvalidValue`].
pub fn decode_transfers(logs: &[RpcLog]) -> eyre::Result<Vec<DecodedTransfer>> {
    const METHOD: &str = "eth_getLogs";
    let mut transfers = Vec::new();

    for log in logs.iter().filter(|log| is_transfer_log(log)) {
        let token = hex::require_address(METHOD, "address", log.address.as_deref())?;
        let from = hex::require_b256(METHOD, "topics[1]", Some(log.topics[1].as_str()))?;
        let to = hex::require_b256(METHOD, "topics[2]", Some(log.topics[2].as_str()))?;
        let tx_hash = hex::require_b256(METHOD, "transactionHash", log.transaction_hash.as_deref())?;
        let log_index = hex::require_u64(METHOD, "logIndex", log.log_index.as_deref())?;
        let block_number = hex::require_u64(METHOD, "blockNumber", log.block_number.as_deref())?;

        let value = hex::parse_u256(log.data.as_deref()).ok_or_else(|| {
            TransferDecodeError::InvalidValue {
                tx_hash: log.transaction_hash.clone(),
                log_index: log.log_index.clone(),
                raw: log.data.clone(),
            }
        })?;

        transfers.push(DecodedTransfer {
            token,
            // Indexed addresses are right-aligned in their 32-byte topic.
            from: Address::from_word(from),
            to: Address::from_word(to),
            value,
            tx_hash,
            log_index,
            block_number,
        });
    }

    Ok(transfers)
}

pub fn u256_to_decimal(value: U256) -> BigDecimal {
    let bytes: [u8; 32] = value.to_be_bytes();
    BigDecimal::new(BigInt::from_bytes_be(Sign::Plus, &bytes), 0)
}

/// Net a batch of transfers of one token into per-holder deltas.
///
/// Zero-value transfers are ignored. The zero address only ever stands for
/// mint (no debit) or burn (no credit) and never receives a delta. Holders
/// whose transfers cancel out are dropped. Output is sorted by holder.
pub fn aggregate_deltas<'a, I>(transfers: I) -> Vec<HolderDelta>
where
    I: IntoIterator<Item = &'a DecodedTransfer>,
{
    let mut net: BTreeMap<Address, BigDecimal> = BTreeMap::new();

    for transfer in transfers {
        if transfer.value.is_zero() {
            continue;
        }
        let amount = u256_to_decimal(transfer.value);

        if transfer.from != Address::ZERO {
            let entry = net.entry(transfer.from).or_insert_with(BigDecimal::zero);
            *entry -= &amount;
        }
        if transfer.to != Address::ZERO {
            let entry = net.entry(transfer.to).or_insert_with(BigDecimal::zero);
            *entry += &amount;
        }
    }

    net.into_iter()
        .filter(|(_, delta)| !delta.is_zero())
        .map(|(holder, delta)| HolderDelta { holder, delta })
        .collect()
}

/// Group transfers by token contract, preserving log order within a token.
pub fn group_by_token(transfers: &[DecodedTransfer]) -> BTreeMap<Address, Vec<&DecodedTransfer>> {
    let mut grouped: BTreeMap<Address, Vec<&DecodedTransfer>> = BTreeMap::new();
    for transfer in transfers {
        grouped.entry(transfer.token).or_default().push(transfer);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const TOKEN: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn topic_for(address: Address) -> String {
        format!("{:#x}", address.into_word())
    }

    fn transfer_log(from: Address, to: Address, data: &str, log_index: u64) -> RpcLog {
        RpcLog {
            address: Some(TOKEN.to_string()),
            topics: vec![
                format!("{:#x}", Transfer::SIGNATURE_HASH),
                topic_for(from),
                topic_for(to),
            ],
            data: Some(data.to_string()),
            block_number: Some("0x10".into()),
            block_hash: Some(format!("0x{}", "ab".repeat(32))),
            transaction_hash: Some(format!("0x{}", "cd".repeat(32))),
            transaction_index: Some("0x0".into()),
            log_index: Some(format!("0x{log_index:x}")),
            removed: None,
        }
    }

    fn value_data(value: u64) -> String {
        format!("0x{value:064x}")
    }

    fn transfer(from: Address, to: Address, value: u64) -> DecodedTransfer {
        DecodedTransfer {
            token: Address::from_str(TOKEN).unwrap(),
            from,
            to,
            value: U256::from(value),
            tx_hash: B256::ZERO,
            log_index: 0,
            block_number: 0,
        }
    }

    fn delta_of(deltas: &[HolderDelta], holder: Address) -> Option<BigDecimal> {
        deltas
            .iter()
            .find(|d| d.holder == holder)
            .map(|d| d.delta.clone())
    }

    #[test]
    fn test_transfer_topic_is_canonical() {
        assert_eq!(
            format!("{:#x}", transfer_topic()),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_decodes_transfer_log() {
        let logs = vec![transfer_log(addr(1), addr(2), &value_data(1_000_000), 3)];
        let decoded = decode_transfers(&logs).unwrap();
        assert_eq!(decoded.len(), 1);
        let t = &decoded[0];
        assert_eq!(t.from, addr(1));
        assert_eq!(t.to, addr(2));
        assert_eq!(t.value, U256::from(1_000_000u64));
        assert_eq!(t.log_index, 3);
        assert_eq!(t.block_number, 16);
        assert_eq!(t.token, Address::from_str(TOKEN).unwrap());
    }

    #[test]
    fn test_skips_foreign_removed_and_nft_logs() {
        let mut other_event = transfer_log(addr(1), addr(2), &value_data(5), 0);
        other_event.topics[0] = format!("0x{}", "11".repeat(32));

        let mut removed = transfer_log(addr(1), addr(2), &value_data(5), 1);
        removed.removed = Some(true);

        let mut short = transfer_log(addr(1), addr(2), &value_data(5), 2);
        short.topics.truncate(2);

        let mut nft = transfer_log(addr(1), addr(2), "0x", 3);
        nft.topics.push(format!("0x{:064x}", 42));

        let decoded = decode_transfers(&[other_event, removed, short, nft]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_non_hex_value_is_an_error_not_zero() {
        let logs = vec![transfer_log(addr(1), addr(2), "0xnot-a-number", 0)];
        let err = decode_transfers(&logs).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferDecodeError>(),
            Some(TransferDecodeError::InvalidValue { .. })
        ));

        let logs = vec![transfer_log(addr(1), addr(2), "0x", 0)];
        assert!(decode_transfers(&logs).is_err());
    }

    #[test]
    fn test_bad_structural_field_blames_endpoint() {
        let mut log = transfer_log(addr(1), addr(2), &value_data(1), 0);
        log.transaction_hash = Some("0x1234".into());
        let err = decode_transfers(&[log]).unwrap_err();
        assert!(err.downcast_ref::<crate::rpc::RpcError>().is_some());
    }

    #[test]
    fn test_mint_then_transfer_nets_per_holder() {
        let x = addr(0xaa);
        let y = addr(0xbb);
        let deltas = aggregate_deltas(&[
            transfer(Address::ZERO, x, 100),
            transfer(x, y, 40),
        ]);
        assert_eq!(deltas.len(), 2);
        assert_eq!(delta_of(&deltas, x), Some(BigDecimal::from(60)));
        assert_eq!(delta_of(&deltas, y), Some(BigDecimal::from(40)));
        assert_eq!(delta_of(&deltas, Address::ZERO), None);
    }

    #[test]
    fn test_burn_only_debits_sender() {
        let x = addr(0xaa);
        let deltas = aggregate_deltas(&[transfer(x, Address::ZERO, 7)]);
        assert_eq!(deltas, vec![HolderDelta {
            holder: x,
            delta: BigDecimal::from(-7),
        }]);
    }

    #[test]
    fn test_zero_value_and_cancelling_transfers_are_dropped() {
        let x = addr(1);
        let y = addr(2);
        let deltas = aggregate_deltas(&[
            transfer(x, y, 0),
            transfer(x, y, 25),
            transfer(y, x, 25),
        ]);
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let (a, b, c) = (addr(1), addr(2), addr(3));
        let batch = vec![
            transfer(a, b, 10),
            transfer(b, c, 3),
            transfer(c, a, 1),
            transfer(a, c, 4),
        ];
        let mut reversed = batch.clone();
        reversed.reverse();
        assert_eq!(aggregate_deltas(&batch), aggregate_deltas(&reversed));

        // Same as applying each transfer one at a time.
        let mut one_by_one: BTreeMap<Address, BigDecimal> = BTreeMap::new();
        for t in &batch {
            for d in aggregate_deltas(std::iter::once(t)) {
                *one_by_one.entry(d.holder).or_insert_with(BigDecimal::zero) += d.delta;
            }
        }
        for d in aggregate_deltas(&batch) {
            assert_eq!(one_by_one.get(&d.holder), Some(&d.delta));
        }
    }

    #[test]
    fn test_u256_max_is_exact() {
        let decimal = u256_to_decimal(U256::MAX);
        assert_eq!(decimal.to_string(), U256::MAX.to_string());
    }

    #[test]
    fn test_group_by_token() {
        let other = addr(9);
        let mut t = transfer(addr(1), addr(2), 5);
        t.token = other;
        let batch = vec![transfer(addr(1), addr(2), 1), t];
        let grouped = group_by_token(&batch);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&other].len(), 1);
    }
}
