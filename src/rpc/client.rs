use alloy::primitives::{Address, B256};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::{RpcError, MIN_RETRY_AFTER};
use super::hex;
use super::types::{LogFilter, RpcBlock, RpcLog, RpcReceipt, RpcResponse};

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    /// Requests per second. `None` or a non-positive value disables pacing.
    pub qps: Option<f64>,
    pub timeout: Duration,
    /// Used when a throttled response carries no usable `Retry-After`.
    pub rate_limit_fallback: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            qps: None,
            timeout: Duration::from_secs(30),
            rate_limit_fallback: Duration::from_millis(2000),
        }
    }
}

/// Hands out send slots at most once per `interval`. Callers queue on the
/// mutex and each one pushes the next slot forward, so a burst of concurrent
/// calls is spread out instead of hitting the provider at once.
struct Pacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Pacer {
    fn new(qps: f64) -> Option<Self> {
        if !qps.is_finite() || qps <= 0.0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs_f64(1.0 / qps),
            next_slot: Mutex::new(Instant::now()),
        })
    }

    async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// JSON-RPC client bound to a single endpoint.
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    pacer: Option<Pacer>,
    rate_limit_fallback: Duration,
    next_id: AtomicU64,
    block_receipts_unsupported: AtomicBool,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, options: RpcClientOptions) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| eyre::eyre!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            url: url.into(),
            http,
            pacer: options.qps.and_then(Pacer::new),
            rate_limit_fallback: options.rate_limit_fallback.max(MIN_RETRY_AFTER),
            next_id: AtomicU64::new(1),
            block_receipts_unsupported: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether `eth_getBlockReceipts` has been ruled out for this endpoint.
    pub fn block_receipts_unsupported(&self) -> bool {
        self.block_receipts_unsupported.load(Ordering::Relaxed)
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        const METHOD: &str = "eth_blockNumber";
        let raw: Option<String> = self.call(METHOD, json!([])).await?;
        hex::require_u64(METHOD, "result", raw.as_deref())
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, RpcError> {
        let logs: Option<Vec<RpcLog>> = self.call("eth_getLogs", json!([filter])).await?;
        Ok(logs.unwrap_or_default())
    }

    /// `eth_getLogs` over `[from, to]`, optionally scoped to one contract.
    pub async fn get_logs_range(
        &self,
        from: u64,
        to: u64,
        address: Option<Address>,
        topics: Option<Vec<Option<B256>>>,
    ) -> Result<Vec<RpcLog>, RpcError> {
        let filter = LogFilter {
            from_block: hex::to_quantity(from),
            to_block: hex::to_quantity(to),
            address: address.map(|a| format!("{a:#x}")),
            topics: topics.map(|topics| {
                topics
                    .into_iter()
                    .map(|t| t.map(|t| format!("{t:#x}")))
                    .collect()
            }),
        };
        self.get_logs(&filter).await
    }

    pub async fn get_block_with_transactions(&self, number: u64) -> Result<RpcBlock, RpcError> {
        const METHOD: &str = "eth_getBlockByNumber";
        let block: Option<RpcBlock> = self
            .call(METHOD, json!([hex::to_quantity(number), true]))
            .await?;
        block.ok_or_else(|| RpcError::Missing {
            method: METHOD,
            what: format!("block {number}"),
        })
    }

    pub async fn get_transaction_receipt(&self, tx_hash: B256) -> Result<RpcReceipt, RpcError> {
        const METHOD: &str = "eth_getTransactionReceipt";
        let receipt: Option<RpcReceipt> = self.call(METHOD, json!([format!("{tx_hash:#x}")])).await?;
        receipt.ok_or_else(|| RpcError::Missing {
            method: METHOD,
            what: format!("transaction {tx_hash:#x}"),
        })
    }

    /// All receipts of a block in one call.
    ///
    /// Returns `Ok(None)` when the endpoint does not implement the method.
    /// The first "method not found" is remembered for the lifetime of this
    /// client and the call is never attempted again.
    pub async fn get_block_receipts(
        &self,
        block_hash: B256,
    ) -> Result<Option<Vec<RpcReceipt>>, RpcError> {
        const METHOD: &str = "eth_getBlockReceipts";
        if self.block_receipts_unsupported() {
            return Ok(None);
        }

        match self
            .call::<Vec<RpcReceipt>>(METHOD, json!([format!("{block_hash:#x}")]))
            .await
        {
            Ok(Some(receipts)) => Ok(Some(receipts)),
            Ok(None) => Err(RpcError::Missing {
                method: METHOD,
                what: format!("block {block_hash:#x}"),
            }),
            Err(e) if e.is_method_not_found() => {
                self.block_receipts_unsupported.store(true, Ordering::Relaxed);
                tracing::info!(
                    endpoint = %redact_url(&self.url),
                    "eth_getBlockReceipts not supported, falling back to per-transaction receipts"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        if let Some(pacer) = &self.pacer {
            pacer.wait().await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|source| RpcError::Transport { method, source })?;

        let status = response.status().as_u16();
        match status {
            429 | 503 => {
                let retry_after =
                    retry_after(response.headers()).unwrap_or(self.rate_limit_fallback);
                return Err(RpcError::RateLimited {
                    method,
                    retry_after: retry_after.max(MIN_RETRY_AFTER),
                });
            }
            401 | 403 => return Err(RpcError::Unauthorized { method, status }),
            _ => {}
        }

        if !response.status().is_success() {
            let mut body = response
                .text()
                .await
                .map_err(|source| RpcError::Transport { method, source })?;
            truncate_utf8(&mut body, MAX_ERROR_BODY);
            return Err(RpcError::Http {
                method,
                status,
                body,
            });
        }

        let envelope: RpcResponse = response.json().await.map_err(|e| RpcError::Malformed {
            method,
            detail: e.to_string(),
        })?;

        if let Some(err) = envelope.error {
            return Err(RpcError::from_rpc_object(
                method,
                err.code,
                err.message,
                err.data,
                self.rate_limit_fallback,
            ));
        }

        match envelope.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RpcError::Malformed {
                    method,
                    detail: e.to_string(),
                }),
        }
    }
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = raw.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Scheme and host only. Provider URLs routinely embed API keys in the path.
pub fn redact_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("unknown")
        ),
        Err(_) => "invalid-url".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.5"));
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(500)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("https://eth-mainnet.g.alchemy.com/v2/SECRETKEY"),
            "https://eth-mainnet.g.alchemy.com"
        );
        assert_eq!(redact_url("not a url"), "invalid-url");
    }

    #[test]
    fn test_pacer_disabled_for_non_positive_qps() {
        assert!(Pacer::new(0.0).is_none());
        assert!(Pacer::new(-1.0).is_none());
        assert!(Pacer::new(f64::NAN).is_none());
        let pacer = Pacer::new(4.0).unwrap();
        assert_eq!(pacer.interval, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_pacer_spaces_out_concurrent_callers() {
        let pacer = std::sync::Arc::new(Pacer::new(20.0).unwrap());
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pacer = pacer.clone();
                tokio::spawn(async move { pacer.wait().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        // Four slots at 50ms spacing: the last one opens 150ms after the first.
        assert!(start.elapsed() >= Duration::from_millis(145));
    }

    #[test]
    fn test_truncate_utf8_respects_char_boundaries() {
        let mut s = "é".repeat(10);
        truncate_utf8(&mut s, 5);
        assert_eq!(s, "éé");
    }
}
