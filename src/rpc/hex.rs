use alloy::primitives::{Address, B256, U256};

use super::error::RpcError;

/// Strip a `0x`/`0X` prefix and reject empty payloads.
fn digits(raw: Option<&str>) -> Option<&str> {
    let raw = raw?.trim();
    let body = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))?;
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(body)
}

/// Parse an RPC quantity (`"0x1b4"`) into a `u64`.
///
/// Returns `None` for `null`, `""`, `"0x"`, non-hex digits and values wider
/// than 64 bits. Never panics.
pub fn parse_u64(raw: Option<&str>) -> Option<u64> {
    u64::from_str_radix(digits(raw)?, 16).ok()
}

/// Parse an RPC quantity into a 256-bit unsigned integer.
pub fn parse_u256(raw: Option<&str>) -> Option<U256> {
    let body = digits(raw)?;
    if body.len() > 64 {
        // Leading zeros are legal, anything that survives them must fit 32 bytes.
        let trimmed = body.trim_start_matches('0');
        if trimmed.len() > 64 {
            return None;
        }
        if trimmed.is_empty() {
            return Some(U256::ZERO);
        }
        return U256::from_str_radix(trimmed, 16).ok();
    }
    U256::from_str_radix(body, 16).ok()
}

/// Receipt `status` style booleans: `0x1` is true, `0x0` is false.
pub fn parse_bool(raw: Option<&str>) -> Option<bool> {
    match parse_u64(raw)? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

/// Parse a byte string. Unlike quantities, `"0x"` is a valid empty buffer.
pub fn parse_bytes(raw: Option<&str>) -> Option<Vec<u8>> {
    let raw = raw?.trim();
    let body = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))?;
    hex::decode(body).ok()
}

pub fn parse_address(raw: Option<&str>) -> Option<Address> {
    let bytes = parse_bytes(raw)?;
    (bytes.len() == 20).then(|| Address::from_slice(&bytes))
}

pub fn parse_b256(raw: Option<&str>) -> Option<B256> {
    let bytes = parse_bytes(raw)?;
    (bytes.len() == 32).then(|| B256::from_slice(&bytes))
}

/// Encode a block number as an RPC quantity.
pub fn to_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

pub fn u256_to_quantity(value: U256) -> String {
    format!("0x{value:x}")
}

// ============================================================
// Required-field helpers
// ============================================================
//
// Call sites that cannot proceed without a value turn the sentinel into a
// typed error naming the RPC method and the field, so a bad payload can be
// pinned on the endpoint that produced it.

fn invalid(method: &'static str, field: &'static str, raw: Option<&str>) -> RpcError {
    RpcError::InvalidHex {
        method,
        field,
        raw: raw.map(str::to_owned),
    }
}

pub fn require_u64(method: &'static str, field: &'static str, raw: Option<&str>) -> Result<u64, RpcError> {
    parse_u64(raw).ok_or_else(|| invalid(method, field, raw))
}

pub fn require_u256(method: &'static str, field: &'static str, raw: Option<&str>) -> Result<U256, RpcError> {
    parse_u256(raw).ok_or_else(|| invalid(method, field, raw))
}

pub fn require_b256(method: &'static str, field: &'static str, raw: Option<&str>) -> Result<B256, RpcError> {
    parse_b256(raw).ok_or_else(|| invalid(method, field, raw))
}

pub fn require_address(
    method: &'static str,
    field: &'static str,
    raw: Option<&str>,
) -> Result<Address, RpcError> {
    parse_address(raw).ok_or_else(|| invalid(method, field, raw))
}

pub fn require_bytes(
    method: &'static str,
    field: &'static str,
    raw: Option<&str>,
) -> Result<Vec<u8>, RpcError> {
    parse_bytes(raw).ok_or_else(|| invalid(method, field, raw))
}

/// Optional fields: absent is fine, present-but-garbage is not.
pub fn optional_u256(
    method: &'static str,
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<U256>, RpcError> {
    match raw {
        None => Ok(None),
        Some(_) => require_u256(method, field, raw).map(Some),
    }
}

pub fn optional_address(
    method: &'static str,
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<Address>, RpcError> {
    match raw {
        None => Ok(None),
        Some(_) => require_address(method, field, raw).map(Some),
    }
}
