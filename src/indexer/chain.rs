use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::BackfillConfig;
use crate::db::repository;
use crate::endpoints::{resolve_rpc, ChainDefaults, ChainRuntime, ClientSlot, ResolvedRpc};
use crate::engine::{pause, EngineContext};
use crate::indexer::decoder::{self, aggregate_deltas, transfer_topic};
use crate::indexer::fetch::{fetch_range, RangePolicy};
use crate::indexer::mapper;
use crate::indexer::receipt_fetcher::{self, BlockReceipts};
use crate::indexer::types::{ChainBatch, Job, TokenDeltas};
use crate::rpc::types::RpcBlock;
use crate::rpc::{classify, hex, ErrorClass, RpcClient, RpcError};

/// Ceiling for the exponential backoff after consecutive failed cycles.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerMode {
    /// Tail the chain head forever.
    Live,
    /// Index a fixed historical range below the live job, then stop.
    Backfill(BackfillConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    Disabled,
    NoRpc,
    /// Backfill waits for the live job to pin its first block.
    WaitingForLive,
}

impl NotReadyReason {
    fn as_str(&self) -> &'static str {
        match self {
            NotReadyReason::Disabled => "chain disabled",
            NotReadyReason::NoRpc => "no usable RPC endpoint",
            NotReadyReason::WaitingForLive => "waiting for live job to start",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Starting,
    NotReady(NotReadyReason),
    Active,
    BackfillDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    NotReady,
    /// Caught up with the confirmed head.
    Idle,
    Progress,
    BackfillDone,
}

/// `latest - confirmations`, clamped at 0.
pub fn target_block(latest: u64, confirmations: u64) -> u64 {
    latest.saturating_sub(confirmations)
}

/// Where the live job resumes: right after the checkpoint, else the
/// configured start block, else `lookback` blocks behind the head.
pub fn start_block(checkpoint: Option<u64>, configured: Option<u64>, latest: u64, lookback: u64) -> u64 {
    match (checkpoint, configured) {
        (Some(last), _) => last + 1,
        (None, Some(start)) => start,
        (None, None) => latest.saturating_sub(lookback),
    }
}

/// Last block a backfill may index: its configured end (or the confirmed
/// head), and never the live job's first block or later. `None` when the
/// live job started at genesis and nothing is left to backfill.
pub fn backfill_end(backfill: BackfillConfig, live_first: Option<u64>, safe_head: u64) -> Option<u64> {
    let end = backfill.to_block.unwrap_or(safe_head);
    match live_first {
        Some(first) => Some(end.min(first.checked_sub(1)?)),
        None => Some(end),
    }
}

/// `base * 2^(n-1)` after the n-th consecutive failure, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

/// How long to wait before the next cycle after a failure.
pub fn failure_delay(class: ErrorClass, base: Duration, consecutive_failures: u32) -> Duration {
    match class {
        ErrorClass::RateLimited(retry_after) => retry_after.max(base),
        ErrorClass::Endpoint(_) => base,
        ErrorClass::RangeTooLarge | ErrorClass::Other => backoff_delay(base, consecutive_failures),
    }
}

/// One poller per `(chain, mode)`. Cycles never overlap within a poller, so
/// the checkpoint only ever moves forward from a single writer.
pub struct ChainPoller {
    ctx: Arc<EngineContext>,
    defaults: ChainDefaults,
    mode: PollerMode,
    slot: ClientSlot,
    state: PollerState,
    active: Option<ResolvedRpc>,
    backfill_end: Option<u64>,
}

impl ChainPoller {
    pub fn new(ctx: Arc<EngineContext>, defaults: ChainDefaults, mode: PollerMode) -> Self {
        Self {
            ctx,
            defaults,
            mode,
            slot: ClientSlot::new(),
            state: PollerState::Starting,
            active: None,
            backfill_end: None,
        }
    }

    fn job(&self) -> Job {
        match self.mode {
            PollerMode::Live => Job::Live,
            PollerMode::Backfill(_) => Job::Backfill,
        }
    }

    /// Log state changes once instead of on every tick.
    fn transition(&mut self, next: PollerState) {
        if self.state == next {
            return;
        }
        let chain = &self.defaults.name;
        let job = self.job().as_str();
        match next {
            PollerState::NotReady(reason) => {
                tracing::warn!(chain = %chain, job, reason = reason.as_str(), "Chain not ready, pausing");
            }
            PollerState::Active => tracing::info!(chain = %chain, job, "Chain active"),
            PollerState::BackfillDone => tracing::info!(chain = %chain, job, "Backfill complete"),
            PollerState::Starting => {}
        }
        self.state = next;
    }

    /// Run until shutdown (or, for a backfill, until its range is done).
    pub async fn run(mut self, shutdown: CancellationToken) {
        let chain_id = self.defaults.chain_id;
        tracing::info!(chain = %self.defaults.name, chain_id, job = self.job().as_str(), "Starting chain poller");

        let mut failures = 0u32;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let wait = match self.cycle().await {
                Ok(CycleOutcome::Progress) => {
                    failures = 0;
                    None
                }
                Ok(CycleOutcome::Idle) => {
                    failures = 0;
                    Some(self.defaults.poll_interval)
                }
                Ok(CycleOutcome::NotReady) => Some(self.defaults.poll_interval),
                Ok(CycleOutcome::BackfillDone) => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    Some(self.on_failure(&e, failures).await)
                }
            };

            if self.ctx.engine.one_shot {
                break;
            }
            if let Some(wait) = wait {
                if !pause(wait, &shutdown).await {
                    break;
                }
            }
        }

        tracing::info!(chain = %self.defaults.name, job = self.job().as_str(), "Chain poller stopped");
    }

    async fn cycle(&mut self) -> eyre::Result<CycleOutcome> {
        let chain_id = self.defaults.chain_id;
        let runtime = self.ctx.runtime.get_or_load(&self.ctx.pool, &self.defaults).await?;

        if !runtime.enabled {
            self.transition(PollerState::NotReady(NotReadyReason::Disabled));
            return Ok(CycleOutcome::NotReady);
        }
        let Some(resolved) = resolve_rpc(&runtime, &self.ctx.cooldowns, Utc::now()) else {
            self.slot.reset();
            self.active = None;
            self.transition(PollerState::NotReady(NotReadyReason::NoRpc));
            return Ok(CycleOutcome::NotReady);
        };

        self.ctx.spans.set_bounds(chain_id, resolved.bounds);
        let client = self.slot.client_for(&resolved, &self.ctx.client_options())?;
        self.select(resolved.clone());

        let latest = client.block_number().await?;
        let safe_head = target_block(latest, runtime.confirmations);

        let (start, target) = match self.mode {
            PollerMode::Live => {
                let checkpoint = repository::get_checkpoint(&self.ctx.pool, chain_id, Job::Live).await?;
                let start = start_block(
                    checkpoint.map(|c| c.last_block),
                    runtime.start_block,
                    latest,
                    self.ctx.engine.lookback_blocks,
                );
                (start, safe_head)
            }
            PollerMode::Backfill(backfill) => {
                let end = match self.backfill_end {
                    Some(end) => Some(end),
                    None => {
                        let live = repository::get_checkpoint(&self.ctx.pool, chain_id, Job::Live).await?;
                        let Some(live) = live else {
                            self.transition(PollerState::NotReady(NotReadyReason::WaitingForLive));
                            return Ok(CycleOutcome::NotReady);
                        };
                        let end = backfill_end(backfill, Some(live.first_block), safe_head);
                        self.backfill_end = end;
                        end
                    }
                };
                let checkpoint =
                    repository::get_checkpoint(&self.ctx.pool, chain_id, Job::Backfill).await?;
                let start = checkpoint
                    .map(|c| c.last_block + 1)
                    .unwrap_or(backfill.from_block);

                match end {
                    Some(end) if start <= end => (start, end.min(safe_head)),
                    Some(end) => {
                        let handed_off = repository::hand_off_backfilled_tokens(
                            &self.ctx.pool,
                            chain_id,
                            backfill.from_block,
                            end,
                        )
                        .await?;
                        tracing::info!(
                            chain = %self.defaults.name,
                            from = backfill.from_block,
                            to = end,
                            tokens = handed_off,
                            "Backfilled tokens queued for balance rebuild"
                        );
                        self.transition(PollerState::BackfillDone);
                        return Ok(CycleOutcome::BackfillDone);
                    }
                    None => {
                        self.transition(PollerState::BackfillDone);
                        return Ok(CycleOutcome::BackfillDone);
                    }
                }
            }
        };

        self.transition(PollerState::Active);
        if start > target {
            return Ok(CycleOutcome::Idle);
        }

        let policy = RangePolicy {
            max_attempts: self.ctx.engine.max_span_attempts,
            retry_delay: runtime.backoff_base,
        };
        let concurrency = self.ctx.engine.block_fetch_concurrency.max(1);

        let fetched = fetch_range(&self.ctx.spans, chain_id, start, target, &policy, |from, to| {
            let client = client.clone();
            async move { fetch_batch(&client, chain_id, from, to, concurrency).await }
        })
        .await?;

        let stats = repository::persist_chain_batch(&self.ctx.pool, &fetched.value, self.job()).await?;

        tracing::info!(
            chain = %self.defaults.name,
            job = self.job().as_str(),
            from = fetched.from,
            to = fetched.to,
            span = fetched.span(),
            target,
            rows = stats.rows,
            transfers = fetched.value.transfers.len(),
            tokens = stats.tokens_applied,
            tokens_skipped = stats.tokens_skipped,
            holders_upserted = stats.ledger.upserted,
            holders_deleted = stats.ledger.deleted,
            "Persisted block range"
        );

        self.mark_healthy(&runtime, &resolved).await;
        Ok(CycleOutcome::Progress)
    }

    fn select(&mut self, resolved: ResolvedRpc) {
        let changed = self.active.as_ref().map_or(true, |current| {
            current.endpoint_id != resolved.endpoint_id || current.url != resolved.url
        });
        if changed {
            tracing::info!(
                chain = %self.defaults.name,
                endpoint_id = ?resolved.endpoint_id,
                source = ?resolved.source,
                endpoint = %crate::rpc::client::redact_url(&resolved.url),
                min_span = resolved.bounds.min,
                max_span = resolved.bounds.max,
                "Using RPC endpoint"
            );
        }
        self.active = Some(resolved);
    }

    /// Write `ok` back once an endpoint that was recorded unhealthy works again.
    async fn mark_healthy(&self, runtime: &ChainRuntime, resolved: &ResolvedRpc) {
        let Some(endpoint_id) = resolved.endpoint_id else {
            return;
        };
        let stored = runtime
            .endpoints
            .iter()
            .find(|e| e.id == endpoint_id)
            .and_then(|e| e.last_health.as_deref());
        if stored == Some(crate::rpc::EndpointHealth::Ok.as_str()) {
            return;
        }
        self.ctx.mark_endpoint_ok(self.defaults.chain_id, endpoint_id).await;
    }

    async fn on_failure(&mut self, err: &eyre::Report, failures: u32) -> Duration {
        let class = classify(err);
        let delay = failure_delay(class, self.defaults.backoff_base, failures);
        let chain = &self.defaults.name;

        match class {
            ErrorClass::RateLimited(retry_after) => {
                tracing::warn!(
                    chain = %chain,
                    retry_after_ms = retry_after.as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
            }
            ErrorClass::Endpoint(health) => {
                let endpoint_id = self.active.as_ref().and_then(|a| a.endpoint_id);
                match endpoint_id {
                    Some(id) => {
                        self.ctx
                            .demote_endpoint(self.defaults.chain_id, id, health, err)
                            .await
                    }
                    None => tracing::error!(
                        chain = %chain,
                        health = health.as_str(),
                        error = %err,
                        "Configured RPC URL failed and no endpoint pool is available"
                    ),
                }
                self.slot.reset();
                self.active = None;
            }
            ErrorClass::RangeTooLarge | ErrorClass::Other => {
                tracing::error!(
                    chain = %chain,
                    job = self.job().as_str(),
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Cycle failed, retrying from checkpoint"
                );
            }
        }

        delay
    }
}

async fn fetch_block(client: &RpcClient, number: u64) -> Result<(RpcBlock, BlockReceipts), RpcError> {
    const METHOD: &str = "eth_getBlockByNumber";
    let block = client.get_block_with_transactions(number).await?;
    let hash = hex::require_b256(METHOD, "hash", block.hash.as_deref())?;
    let tx_hashes = block
        .transactions
        .iter()
        .map(|tx| hex::require_b256(METHOD, "transactions.hash", tx.hash.as_deref()))
        .collect::<Result<Vec<_>, _>>()?;
    let receipts = receipt_fetcher::fetch_block_receipts(client, hash, &tx_hashes).await?;
    Ok((block, receipts))
}

/// Fetch and map everything in `[from, to]`: every token's transfers, every
/// block with its transactions, receipts and logs.
async fn fetch_batch(
    client: &RpcClient,
    chain_id: i64,
    from: u64,
    to: u64,
    concurrency: usize,
) -> eyre::Result<ChainBatch> {
    let logs = client
        .get_logs_range(from, to, None, Some(vec![Some(transfer_topic())]))
        .await?;
    let transfers = decoder::decode_transfers(&logs)?;

    let deltas = decoder::group_by_token(&transfers)
        .into_iter()
        .map(|(token, group)| TokenDeltas {
            token,
            deltas: aggregate_deltas(group.iter().copied()),
        })
        .filter(|t| !t.deltas.is_empty())
        .collect();

    let blocks: Vec<(RpcBlock, BlockReceipts)> = futures::stream::iter(from..=to)
        .map(|number| fetch_block(client, number))
        .buffered(concurrency)
        .try_collect()
        .await?;

    let mut batch = ChainBatch {
        chain_id,
        from_block: from,
        to_block: to,
        transfers: transfers
            .iter()
            .map(|t| mapper::map_transfer(chain_id, t))
            .collect(),
        deltas,
        ..Default::default()
    };

    for (block, receipts) in &blocks {
        let (row, transactions) = mapper::map_block(chain_id, block)?;
        batch.blocks.push(row);
        batch.transactions.extend(transactions);
        for receipt in &receipts.receipts {
            let (row, logs) = mapper::map_receipt(receipts.method, chain_id, receipt)?;
            batch.receipts.push(row);
            batch.logs.extend(logs);
        }
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::EndpointHealth;

    #[test]
    fn test_target_block_clamps_at_zero() {
        assert_eq!(target_block(100, 6), 94);
        assert_eq!(target_block(3, 6), 0);
    }

    #[test]
    fn test_start_block_priority() {
        assert_eq!(start_block(Some(500), Some(10), 1_000_000, 50_000), 501);
        assert_eq!(start_block(None, Some(10), 1_000_000, 50_000), 10);
        assert_eq!(start_block(None, None, 1_000_000, 50_000), 950_000);
        assert_eq!(start_block(None, None, 1_000, 50_000), 0);
    }

    #[test]
    fn test_backfill_end_stops_before_live() {
        let cfg = BackfillConfig {
            from_block: 100,
            to_block: None,
        };
        assert_eq!(backfill_end(cfg, Some(5_000), 9_000), Some(4_999));
        assert_eq!(backfill_end(cfg, None, 9_000), Some(9_000));
        assert_eq!(backfill_end(cfg, Some(0), 9_000), None);

        let bounded = BackfillConfig {
            from_block: 100,
            to_block: Some(2_000),
        };
        assert_eq!(backfill_end(bounded, Some(5_000), 9_000), Some(2_000));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 10), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_failure_delay_per_class() {
        let base = Duration::from_secs(1);
        assert_eq!(
            failure_delay(ErrorClass::RateLimited(Duration::from_secs(3)), base, 1),
            Duration::from_secs(3)
        );
        assert_eq!(
            failure_delay(ErrorClass::RateLimited(Duration::from_millis(10)), base, 1),
            base
        );
        assert_eq!(
            failure_delay(ErrorClass::Endpoint(EndpointHealth::Unauthorized), base, 5),
            base
        );
        assert_eq!(failure_delay(ErrorClass::Other, base, 3), Duration::from_secs(4));
    }
}
